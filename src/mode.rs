//! Session execution mode and the lock that guards it during a batch.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ShipflowError;

/// Whether a batch needs an explicit preview and confirmation before it
/// creates live shipments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Confirm,
    Auto,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Confirm => write!(f, "confirm"),
            ExecutionMode::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Default)]
struct ModeState {
    mode: ExecutionMode,
    locked: bool,
}

/// Per-session mode holder. All methods are safe to call from any thread.
#[derive(Debug, Default)]
pub struct ModeManager {
    state: Mutex<ModeState>,
}

impl ModeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ModeState> {
        // The state is two plain fields; a poisoned lock still holds valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_mode(&self) -> ExecutionMode {
        self.state().mode
    }

    pub fn set_mode(&self, mode: ExecutionMode) -> Result<(), ShipflowError> {
        let mut state = self.state();
        if state.locked {
            return Err(ShipflowError::LockedMode);
        }
        debug!(from = %state.mode, to = %mode, "execution mode changed");
        state.mode = mode;
        Ok(())
    }

    pub fn lock(&self) {
        self.state().locked = true;
    }

    pub fn unlock(&self) {
        self.state().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Back to confirm mode, unlocked.
    pub fn reset(&self) {
        *self.state() = ModeState::default();
    }

    /// Lock the mode for the duration of a batch. Only one batch per
    /// session may hold the guard; the lock is released when the guard is
    /// dropped, on every exit path.
    pub fn acquire(&self) -> Result<ModeGuard<'_>, ShipflowError> {
        let mut state = self.state();
        if state.locked {
            return Err(ShipflowError::ExecutionInProgress);
        }
        state.locked = true;
        Ok(ModeGuard {
            manager: self,
            mode: state.mode,
        })
    }
}

/// Held while a batch executes.
#[derive(Debug)]
pub struct ModeGuard<'a> {
    manager: &'a ModeManager,
    mode: ExecutionMode,
}

impl ModeGuard<'_> {
    /// The mode that was in effect when the batch started.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.manager.unlock();
    }
}
