use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::{Style, Term};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use shipflow::batch::{
    BatchEngine, BatchJob, FileJobStore, JobStatus, JobStore, RecoveryChoice, RetryConfig,
    find_interrupted, recovery_prompt,
};
use shipflow::carrier::{CarrierClient, CarrierService};
use shipflow::cli::{Cli, Command};
use shipflow::config::ShipflowConfig;
use shipflow::error::{ShipflowError, codes};
use shipflow::events::AuditLog;
use shipflow::mode::ExecutionMode;
use shipflow::session::Session;
use shipflow::storage::build_label_storage;
use shipflow::ui::{ConsoleProgress, print_jobs, print_preview, print_result};

type Engine = BatchEngine<Arc<CarrierClient>>;

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Attach the stable error code so operators can grep for it.
fn coded(err: ShipflowError) -> anyhow::Error {
    anyhow::anyhow!("[{}] {err}", err.code())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = ShipflowConfig::load(cli.config.as_deref())?;

    if let Command::Status = cli.command {
        let store = FileJobStore::new(config.jobs_dir());
        let jobs = store.list().await.map_err(coded)?;
        print_jobs(&jobs);
        return Ok(());
    }

    config.validate().map_err(coded)?;

    let client = Arc::new(
        CarrierClient::new(config.worker())
            .with_handshake_timeout(config.handshake_timeout())
            .with_shutdown_grace(config.shutdown_grace()),
    );

    let needs_worker = !matches!(cli.command, Command::Cancel { .. });
    if needs_worker {
        debug!(program = %config.worker_command, "starting carrier worker");
        client.start().await.map_err(|e| coded(e.into()))?;
        if let Err(e) = client.handshake().await {
            client.shutdown().await;
            return Err(coded(e.into()));
        }
    }

    let outcome = dispatch(cli.command, &config, client.clone()).await;
    client.shutdown().await;
    outcome
}

async fn dispatch(
    command: Command,
    config: &ShipflowConfig,
    client: Arc<CarrierClient>,
) -> Result<()> {
    match command {
        Command::Tools => {
            let tools = client.list_tools().await.map_err(|e| coded(e.into()))?;
            let bold = Style::new().bold();
            for tool in tools {
                println!(
                    "  {}  {}",
                    bold.apply_to(&tool.name),
                    tool.description.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Void { shipment_id } => {
            let outcome = CarrierService::new(client)
                .void_shipment(&shipment_id)
                .await
                .map_err(|e| coded(e.into()))?;
            if outcome.success {
                println!("Voided {shipment_id}: {}", outcome.description);
                Ok(())
            } else {
                bail!(
                    "void of {shipment_id} rejected: {} {}",
                    outcome.code,
                    outcome.description
                )
            }
        }
        Command::Preview { rows, job_id } => {
            let (engine, _session) = build_engine(config, client)?;
            let mut job = open_job(&engine, rows.as_deref(), job_id).await?;
            let watcher = spawn_stop_watcher(&engine);
            let preview = engine.preview(&mut job).await;
            watcher.abort();
            let preview = match preview {
                Ok(preview) => preview,
                Err(ShipflowError::Interrupted) => {
                    println!("Preview of job {} interrupted.", job.id);
                    return Ok(());
                }
                Err(e) => return Err(coded(e)),
            };
            print_preview(&preview);
            println!(
                "\nRun `shipflow run --job-id {} --yes` to create these shipments.",
                job.id
            );
            Ok(())
        }
        Command::Run {
            rows,
            job_id,
            mode,
            yes,
        } => {
            let (engine, session) = build_engine(config, client)?;
            session.modes.set_mode(mode).map_err(coded)?;
            let mut job = open_job(&engine, rows.as_deref(), job_id).await?;

            if mode == ExecutionMode::Confirm && (!yes || job.previewed_at.is_none()) {
                if job.previewed_at.is_none() {
                    let preview = engine.preview(&mut job).await.map_err(coded)?;
                    print_preview(&preview);
                }
                println!(
                    "\nConfirm mode: re-run with `shipflow run --job-id {} --yes` to ship.",
                    job.id
                );
                return Ok(());
            }

            let watcher = spawn_stop_watcher(&engine);
            let result = engine.execute(&mut job).await;
            watcher.abort();
            report(result)
        }
        Command::Resume { job_id } => {
            let (engine, _session) = build_engine(config, client)?;
            let interrupted = find_interrupted(engine.store().as_ref())
                .await
                .map_err(coded)?;
            let info = match job_id {
                Some(id) => match interrupted.into_iter().find(|i| i.job_id == id) {
                    Some(info) => info,
                    None => {
                        let job = engine.store().load(&id).await.map_err(coded)?;
                        return Err(coded(ShipflowError::NotResumable {
                            job_id: job.id,
                            status: job.status,
                        }));
                    }
                },
                None => match interrupted.into_iter().next() {
                    Some(info) => info,
                    None => {
                        println!("No interrupted jobs.");
                        return Ok(());
                    }
                },
            };

            print!("{}", recovery_prompt(&info));
            let term = Term::stdout();
            term.write_str("> ")?;
            let answer = term.read_line().context("reading recovery choice")?;
            let choice: RecoveryChoice = answer.parse().map_err(anyhow::Error::msg)?;

            match choice {
                RecoveryChoice::Resume => {
                    let watcher = spawn_stop_watcher(&engine);
                    let result = engine.resume(&info.job_id).await;
                    watcher.abort();
                    report(result)
                }
                RecoveryChoice::Cancel => {
                    let job = engine.cancel(&info.job_id).await.map_err(coded)?;
                    print_result(&job.to_result());
                    Ok(())
                }
            }
        }
        Command::Cancel { job_id } => {
            let (engine, _session) = build_engine(config, client)?;
            let job = engine.cancel(&job_id).await.map_err(coded)?;
            print_result(&job.to_result());
            Ok(())
        }
        Command::Status => Ok(()),
    }
}

fn build_engine(
    config: &ShipflowConfig,
    client: Arc<CarrierClient>,
) -> Result<(Engine, Session)> {
    let session = Session::new();
    session.events.add_observer(Arc::new(ConsoleProgress::new()));
    session
        .events
        .add_observer(Arc::new(AuditLog::new(config.audit_log_path())));

    let storage = build_label_storage(&config.storage_settings().map_err(coded)?)
        .map_err(|e| coded(e.into()))?;
    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(config.jobs_dir()));

    let engine = BatchEngine::new(CarrierService::new(client), storage, store, &session)
        .with_retry(RetryConfig {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
        })
        .with_max_preview_rows(config.max_preview_rows);
    Ok((engine, session))
}

/// Load a stored job by id, or create one from a JSON rows file. A rows file
/// never replaces a stored job of the same id.
async fn open_job(
    engine: &Engine,
    rows: Option<&Path>,
    job_id: Option<String>,
) -> Result<BatchJob> {
    match (rows, job_id) {
        (None, Some(id)) => Ok(engine.store().load(&id).await.map_err(coded)?),
        (Some(path), id) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let payloads: Vec<serde_json::Value> = serde_json::from_str(&contents)
                .with_context(|| format!("{} must hold a JSON array of rows", path.display()))?;
            let job = engine.create_job(id, payloads).await.map_err(|e| match e {
                ShipflowError::JobExists(id) => anyhow::anyhow!(
                    "[{}] job {id} already exists; run it with `--job-id {id}` and no rows file",
                    codes::DATA_ERROR
                ),
                other => coded(other),
            })?;
            Ok(job)
        }
        (None, None) => bail!("pass a rows file or --job-id"),
    }
}

fn spawn_stop_watcher(engine: &Engine) -> tokio::task::JoinHandle<()> {
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("stop requested; finishing the row in flight");
            stop.request_stop();
        }
    })
}

fn report(result: Result<shipflow::batch::BatchResult, ShipflowError>) -> Result<()> {
    match result {
        Ok(result) => {
            print_result(&result);
            if result.status == JobStatus::Failed {
                bail!("job {} failed", result.job_id);
            }
            Ok(())
        }
        // The progress observer has already told the operator how to resume.
        Err(ShipflowError::Interrupted) => Ok(()),
        Err(e) => Err(coded(e)),
    }
}
