//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--verbose`, `--config`) and one
//! [`Command`] per operator action.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::mode::ExecutionMode;

/// Shipflow: batch shipment creation through a carrier worker.
#[derive(Debug, Parser)]
#[command(name = "shipflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Path to the config file (default: ./shipflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Quote a batch without creating shipments.
    Preview {
        /// JSON file holding an array of shipment request bodies.
        rows: Option<PathBuf>,

        /// Reuse a stored job, or name a new one.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Create the shipments of a batch.
    Run {
        /// JSON file holding an array of shipment request bodies.
        rows: Option<PathBuf>,

        #[arg(long)]
        job_id: Option<String>,

        /// `confirm` requires a previewed job and --yes; `auto` ships at once.
        #[arg(long, value_enum, default_value_t = ExecutionMode::Confirm)]
        mode: ExecutionMode,

        /// Confirm a previewed job.
        #[arg(long, short, default_value_t = false)]
        yes: bool,
    },

    /// Resume an interrupted job.
    Resume {
        /// Job to resume; the oldest interrupted job when omitted.
        job_id: Option<String>,
    },

    /// Abandon an interrupted job.
    Cancel { job_id: String },

    /// List stored jobs.
    Status,

    /// List the tools the carrier worker offers.
    Tools,

    /// Void a shipment.
    Void { shipment_id: String },
}
