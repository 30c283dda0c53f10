pub mod client;
pub mod error;
pub mod protocol;
pub mod service;

pub use client::{CarrierClient, ToolCaller, WorkerCommand};
pub use error::{CarrierError, WorkerFault};
pub use protocol::ToolInfo;
pub use service::{CarrierService, RateQuote, ShipmentReceipt, VoidOutcome};
