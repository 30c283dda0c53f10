//! Shipflow: batch shipment execution against a carrier automation worker.
//!
//! A batch is a list of shipment request bodies. The [`batch::BatchEngine`]
//! quotes it (preview), ships it row by row with fail-fast semantics
//! (execute), and picks up where it left off after an interruption
//! (resume). Carrier calls go through a child worker process speaking
//! line-delimited JSON-RPC ([`carrier`]); label PDFs are staged and
//! promoted through a [`storage::LabelStorage`] backend.

pub mod batch;
pub mod carrier;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod mode;
pub mod session;
pub mod storage;
pub mod ui;
