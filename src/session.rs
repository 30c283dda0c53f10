//! Per-session context.
//!
//! A session owns its mode manager, event emitter and streaming bridge.
//! Nothing here is global: two sessions never see each other's mode or
//! observers.

use std::sync::Arc;

use crate::events::{BatchEmitter, StreamingBridge};
use crate::mode::ModeManager;

pub struct Session {
    pub modes: Arc<ModeManager>,
    pub events: Arc<BatchEmitter>,
    pub stream: Arc<StreamingBridge>,
}

impl Session {
    /// Fresh session in confirm mode with the streaming bridge registered.
    pub fn new() -> Self {
        let stream = Arc::new(StreamingBridge::new());
        let events = Arc::new(BatchEmitter::new());
        events.add_observer(stream.clone());
        Self {
            modes: Arc::new(ModeManager::new()),
            events,
            stream,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
