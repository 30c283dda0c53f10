//! Subprocess client for the carrier automation worker.
//!
//! [`CarrierClient`] owns exactly one worker process and talks to it over its
//! stdin/stdout using newline-delimited JSON-RPC. One call is in flight at a
//! time per client; callers needing parallelism run several clients.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{CarrierError, WorkerFault};
use super::protocol::{
    CallToolParams, CallToolResult, IncomingMessage, InitializeParams, JsonRpcRequest,
    ListToolsResult, ToolInfo, methods,
};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Anything that can invoke a carrier tool and hand back its JSON result.
///
/// The batch engine depends on this rather than on [`CarrierClient`] so it
/// can be driven by scripted carriers in tests.
#[allow(async_fn_in_trait)]
pub trait ToolCaller {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CarrierError>;
}

impl<T: ToolCaller> ToolCaller for std::sync::Arc<T> {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CarrierError> {
        (**self).call_tool(name, arguments).await
    }
}

/// How to launch the worker.
///
/// The worker never inherits the parent environment: it sees `PATH` plus the
/// variables added with [`WorkerCommand::env`], nothing else.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn search_path(&self) -> Option<String> {
        self.env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var("PATH").ok())
    }

    /// Resolve the program to an executable path, telling apart a missing
    /// explicit install from a name that is not on `PATH`.
    fn resolve(&self) -> Result<PathBuf, WorkerFault> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 || program.is_absolute() {
            if program.exists() {
                return Ok(program.to_path_buf());
            }
            return Err(WorkerFault::NotInstalled {
                path: self.program.clone(),
            });
        }

        let search = self.search_path().unwrap_or_default();
        std::env::split_paths(&search)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| WorkerFault::NotOnPath {
                program: self.program.clone(),
            })
    }
}

/// A running worker and its pipes.
struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    async fn send(&mut self, line: &str) -> Result<(), CarrierError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(CarrierError::WorkerUnavailable(WorkerFault::NotStarted))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read until the response for `request_id` arrives, skipping worker
    /// notifications and answers to requests nobody is waiting for anymore.
    async fn await_response(&mut self, request_id: u64) -> Result<Value, CarrierError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(CarrierError::WorkerUnavailable(WorkerFault::Exited));
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let message: IncomingMessage = serde_json::from_str(line).map_err(|e| {
                CarrierError::MalformedResponse(format!("{e}: {}", excerpt(line)))
            })?;

            if !message.is_response() {
                debug!(method = ?message.method, "ignoring worker-initiated message");
                continue;
            }
            if !message.answers(request_id) {
                warn!(expected = request_id, got = ?message.id, "discarding uncorrelated response");
                continue;
            }

            if let Some(error) = message.error {
                return Err(CarrierError::Protocol {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                });
            }
            return message.result.ok_or_else(|| {
                CarrierError::MalformedResponse("response has neither result nor error".into())
            });
        }
    }

    /// Release the process after the channel broke.
    async fn reap(mut self) {
        drop(self.stdin.take());
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Protocol client bound to one worker process.
pub struct CarrierClient {
    command: WorkerCommand,
    handshake_timeout: Duration,
    shutdown_grace: Duration,
    // The mutex doubles as the single in-flight slot.
    worker: Mutex<Option<Worker>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
}

impl CarrierClient {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            worker: Mutex::new(None),
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Launch the worker. Calling it again while the worker runs is a no-op.
    pub async fn start(&self) -> Result<(), CarrierError> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let program = self
            .command
            .resolve()
            .map_err(CarrierError::WorkerUnavailable)?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.command.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = self.command.search_path() {
            cmd.env("PATH", path);
        }
        cmd.envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd.spawn().map_err(|e| {
            let fault = match e.kind() {
                std::io::ErrorKind::NotFound => WorkerFault::NotInstalled {
                    path: program.display().to_string(),
                },
                _ => WorkerFault::Spawn(e.to_string()),
            };
            CarrierError::WorkerUnavailable(fault)
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or(CarrierError::WorkerUnavailable(WorkerFault::Spawn(
                "worker stdout was not captured".into(),
            )))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "shipflow::worker", "{line}");
                }
            });
        }

        info!(program = %program.display(), pid = ?child.id(), "carrier worker started");
        *slot = Some(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        Ok(())
    }

    /// Negotiate capabilities. Tool calls are rejected until this succeeds.
    pub async fn handshake(&self) -> Result<(), CarrierError> {
        if self.is_initialized() {
            return Ok(());
        }

        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| CarrierError::MalformedResponse(e.to_string()))?;
        let server = match timeout(
            self.handshake_timeout,
            self.request(methods::INITIALIZE, Some(params)),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                self.terminate().await;
                return Err(CarrierError::WorkerUnavailable(
                    WorkerFault::HandshakeTimeout {
                        after_ms: self.handshake_timeout.as_millis() as u64,
                    },
                ));
            }
        };

        self.notify(methods::INITIALIZED, None).await?;
        self.initialized.store(true, Ordering::SeqCst);
        let server_info = server
            .get("serverInfo")
            .cloned()
            .unwrap_or(Value::Null);
        info!(server = %server_info, "carrier worker initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// True while a worker process is attached and has not exited.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.worker.lock().await;
        match slot.as_mut() {
            Some(worker) => matches!(worker.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Invoke a tool and return the JSON object carried by its first text block.
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value, CarrierError> {
        if !self.is_initialized() {
            return Err(CarrierError::NotInitialized);
        }

        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments,
        })
        .map_err(|e| CarrierError::MalformedResponse(e.to_string()))?;

        debug!(tool, "calling carrier tool");
        let raw = self.request(methods::CALL_TOOL, Some(params)).await?;
        parse_tool_result(tool, raw)
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, CarrierError> {
        if !self.is_initialized() {
            return Err(CarrierError::NotInitialized);
        }
        let raw = self.request(methods::LIST_TOOLS, Some(json!({}))).await?;
        let listed: ListToolsResult = serde_json::from_value(raw)
            .map_err(|e| CarrierError::MalformedResponse(format!("tools/list: {e}")))?;
        Ok(listed.tools)
    }

    /// Close the worker's stdin, give it the grace period to exit, then kill it.
    /// Safe to call any number of times.
    pub async fn shutdown(&self) {
        let taken = self.worker.lock().await.take();
        self.initialized.store(false, Ordering::SeqCst);
        let Some(mut worker) = taken else {
            return;
        };

        drop(worker.stdin.take());
        match timeout(self.shutdown_grace, worker.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "carrier worker exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for carrier worker"),
            Err(_) => {
                warn!(
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "carrier worker ignored shutdown, killing"
                );
                if let Err(e) = worker.child.kill().await {
                    warn!(error = %e, "failed to kill carrier worker");
                }
            }
        }
    }

    async fn terminate(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.reap().await;
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Send a request and wait for its correlated response. A broken channel
    /// releases the worker so later calls fail fast instead of hanging.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, CarrierError> {
        let mut slot = self.worker.lock().await;
        let worker = slot
            .as_mut()
            .ok_or(CarrierError::WorkerUnavailable(WorkerFault::NotStarted))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = JsonRpcRequest::new(id, method, params)
            .to_line()
            .map_err(|e| CarrierError::MalformedResponse(e.to_string()))?;

        let outcome = match worker.send(&line).await {
            Ok(()) => worker.await_response(id).await,
            Err(e) => Err(e),
        };

        if let Err(err) = &outcome {
            if err.is_worker_unavailable() {
                warn!(method, error = %err, "carrier worker channel closed");
                if let Some(worker) = slot.take() {
                    worker.reap().await;
                }
                self.initialized.store(false, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), CarrierError> {
        let mut slot = self.worker.lock().await;
        let worker = slot
            .as_mut()
            .ok_or(CarrierError::WorkerUnavailable(WorkerFault::NotStarted))?;
        let line = JsonRpcRequest::notification(method, params)
            .to_line()
            .map_err(|e| CarrierError::MalformedResponse(e.to_string()))?;
        worker.send(&line).await
    }
}

impl ToolCaller for CarrierClient {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CarrierError> {
        self.call(name, arguments).await
    }
}

fn parse_tool_result(tool: &str, raw: Value) -> Result<Value, CarrierError> {
    let result: CallToolResult = serde_json::from_value(raw)
        .map_err(|e| CarrierError::MalformedResponse(format!("tool '{tool}': {e}")))?;

    if result.is_error {
        return Err(CarrierError::Tool {
            tool: tool.to_string(),
            text: result.first_text().unwrap_or_default().to_string(),
        });
    }

    let text = match result.first_text() {
        Some(text) if !text.trim().is_empty() => text,
        _ => {
            return Err(CarrierError::EmptyResult {
                tool: tool.to_string(),
            });
        }
    };

    let parsed: Value = serde_json::from_str(text).map_err(|e| {
        CarrierError::MalformedResponse(format!("tool '{tool}' returned invalid JSON: {e}"))
    })?;
    if !parsed.is_object() {
        return Err(CarrierError::MalformedResponse(format!(
            "tool '{tool}' returned {parsed}, expected an object"
        )));
    }
    Ok(parsed)
}

fn excerpt(line: &str) -> String {
    line.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_error_flag_becomes_tool_error() {
        let raw = json!({"content": [{"type": "text", "text": "429 rate limit"}], "isError": true});
        let err = parse_tool_result("rate_shipment", raw).unwrap_err();
        match err {
            CarrierError::Tool { tool, text } => {
                assert_eq!(tool, "rate_shipment");
                assert_eq!(text, "429 rate limit");
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_without_text_is_empty() {
        let err = parse_tool_result("create_shipment", json!({"content": []})).unwrap_err();
        assert!(matches!(err, CarrierError::EmptyResult { .. }));

        let blank = json!({"content": [{"type": "text", "text": "  "}]});
        let err = parse_tool_result("create_shipment", blank).unwrap_err();
        assert!(matches!(err, CarrierError::EmptyResult { .. }));
    }

    #[test]
    fn tool_result_must_be_a_json_object() {
        let not_json = json!({"content": [{"type": "text", "text": "ok!"}]});
        assert!(matches!(
            parse_tool_result("t", not_json).unwrap_err(),
            CarrierError::MalformedResponse(_)
        ));

        let array = json!({"content": [{"type": "text", "text": "[1,2]"}]});
        assert!(matches!(
            parse_tool_result("t", array).unwrap_err(),
            CarrierError::MalformedResponse(_)
        ));
    }

    #[test]
    fn resolve_reports_missing_explicit_path_as_not_installed() {
        let cmd = WorkerCommand::new("/definitely/not/here/carrier-worker");
        assert_eq!(
            cmd.resolve().unwrap_err(),
            WorkerFault::NotInstalled {
                path: "/definitely/not/here/carrier-worker".into()
            }
        );
    }

    #[test]
    fn resolve_reports_unknown_bare_name_as_not_on_path() {
        let cmd = WorkerCommand::new("shipflow-no-such-worker-xyz").env("PATH", "/nonexistent-dir");
        assert_eq!(
            cmd.resolve().unwrap_err(),
            WorkerFault::NotOnPath {
                program: "shipflow-no-such-worker-xyz".into()
            }
        );
    }

    #[tokio::test]
    async fn start_fails_with_worker_unavailable_when_missing() {
        let client = CarrierClient::new(WorkerCommand::new("/definitely/not/here/worker"));
        let err = client.start().await.unwrap_err();
        assert!(err.is_worker_unavailable());
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn call_without_start_or_handshake_is_not_initialized() {
        let client = CarrierClient::new(WorkerCommand::new("sh"));
        let err = client.call("rate_shipment", json!({})).await.unwrap_err();
        assert!(matches!(err, CarrierError::NotInitialized));
    }

    #[tokio::test]
    async fn shutdown_without_worker_is_a_noop() {
        let client = CarrierClient::new(WorkerCommand::new("sh"));
        client.shutdown().await;
        client.shutdown().await;
        assert!(!client.is_running().await);
    }

    // Fake workers below are small shell scripts speaking the protocol.
    #[cfg(unix)]
    mod worker {
        use super::*;
        use std::time::Instant;

        const HANDSHAKE: &str = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}'; read line; "#;

        fn fake_worker(script: &str) -> CarrierClient {
            CarrierClient::new(WorkerCommand::new("sh").arg("-c").arg(script))
                .with_handshake_timeout(Duration::from_secs(5))
                .with_shutdown_grace(Duration::from_secs(2))
        }

        #[tokio::test]
        async fn call_before_handshake_sends_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let capture = dir.path().join("stdin.log");
            let client = fake_worker(&format!("cat > '{}'", capture.display()));

            client.start().await.unwrap();
            let err = client.call("create_shipment", json!({})).await.unwrap_err();
            assert!(matches!(err, CarrierError::NotInitialized));

            client.shutdown().await;
            let written = std::fs::read_to_string(&capture).unwrap();
            assert!(written.is_empty(), "worker received: {written}");
        }

        #[tokio::test]
        async fn handshake_then_call_returns_parsed_payload() {
            let script = format!(
                r#"{HANDSHAKE}read line; printf '%s\n' '{{"jsonrpc":"2.0","method":"notifications/message","params":{{}}}}'; printf '%s\n' '{{"jsonrpc":"2.0","id":99,"result":{{}}}}'; printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"content":[{{"type":"text","text":"{{\"trackingNumber\":\"1Z999\"}}"}}],"isError":false}}}}'; read line"#
            );
            let client = fake_worker(&script);
            client.start().await.unwrap();
            client.handshake().await.unwrap();
            assert!(client.is_initialized());

            let result = client.call("create_shipment", json!({"a": 1})).await.unwrap();
            assert_eq!(result["trackingNumber"], "1Z999");

            client.shutdown().await;
            assert!(!client.is_initialized());
        }

        #[tokio::test]
        async fn protocol_error_carries_code_and_message() {
            let script = format!(
                r#"{HANDSHAKE}read line; printf '%s\n' '{{"jsonrpc":"2.0","id":2,"error":{{"code":-32602,"message":"Invalid params","data":{{"field":"request_body"}}}}}}'; read line"#
            );
            let client = fake_worker(&script);
            client.start().await.unwrap();
            client.handshake().await.unwrap();

            let err = client.call("rate_shipment", json!({})).await.unwrap_err();
            match err {
                CarrierError::Protocol { code, message, data } => {
                    assert_eq!(code, -32602);
                    assert_eq!(message, "Invalid params");
                    assert_eq!(data, Some(json!({"field": "request_body"})));
                }
                other => panic!("expected Protocol error, got {other:?}"),
            }
            // A protocol error leaves the worker usable.
            assert!(client.is_running().await);
            client.shutdown().await;
        }

        #[tokio::test]
        async fn list_tools_returns_advertised_tools() {
            let script = format!(
                r#"{HANDSHAKE}read line; printf '%s\n' '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"rate_shipment","description":"Quote a rate"}},{{"name":"create_shipment"}}]}}}}'; read line"#
            );
            let client = fake_worker(&script);
            client.start().await.unwrap();
            client.handshake().await.unwrap();

            let tools = client.list_tools().await.unwrap();
            let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
            assert_eq!(names, vec!["rate_shipment", "create_shipment"]);
            assert_eq!(tools[0].description.as_deref(), Some("Quote a rate"));
            client.shutdown().await;
        }

        #[tokio::test]
        async fn worker_exit_mid_call_is_worker_unavailable() {
            let script = format!("{HANDSHAKE}read line; exit 0");
            let client = fake_worker(&script);
            client.start().await.unwrap();
            client.handshake().await.unwrap();

            let started = Instant::now();
            let err = client.call("create_shipment", json!({})).await.unwrap_err();
            assert!(err.is_worker_unavailable(), "got {err:?}");
            assert!(started.elapsed() < Duration::from_secs(5));

            // Resources were released: no worker, no session.
            assert!(!client.is_running().await);
            assert!(!client.is_initialized());
            let again = client.call("create_shipment", json!({})).await.unwrap_err();
            assert!(matches!(again, CarrierError::NotInitialized));
            client.shutdown().await;
        }

        #[tokio::test]
        async fn handshake_times_out_when_worker_is_silent() {
            let client = CarrierClient::new(
                WorkerCommand::new("sh").arg("-c").arg("while true; do sleep 1; done"),
            )
            .with_handshake_timeout(Duration::from_millis(200));
            client.start().await.unwrap();

            let err = client.handshake().await.unwrap_err();
            assert!(matches!(
                err,
                CarrierError::WorkerUnavailable(WorkerFault::HandshakeTimeout { .. })
            ));
            assert!(!client.is_running().await);
        }

        #[tokio::test]
        async fn shutdown_kills_a_worker_that_ignores_eof() {
            let client = fake_worker("trap '' TERM; while true; do sleep 1; done")
                .with_shutdown_grace(Duration::from_millis(200));
            client.start().await.unwrap();
            assert!(client.is_running().await);

            let started = Instant::now();
            client.shutdown().await;
            assert!(started.elapsed() < Duration::from_secs(3));
            assert!(!client.is_running().await);

            client.shutdown().await;
        }

        #[tokio::test]
        async fn worker_env_is_constrained() {
            let dir = tempfile::tempdir().unwrap();
            let capture = dir.path().join("env.log");
            let client = CarrierClient::new(
                WorkerCommand::new("sh")
                    .arg("-c")
                    .arg(format!("env > '{}'", capture.display()))
                    .env("CLIENT_ID", "abc"),
            )
            .with_shutdown_grace(Duration::from_secs(2));
            client.start().await.unwrap();
            client.shutdown().await;

            let env = std::fs::read_to_string(&capture).unwrap();
            assert!(env.contains("CLIENT_ID=abc"));
            assert!(!env.contains("CARGO_MANIFEST_DIR"));
        }
    }
}
