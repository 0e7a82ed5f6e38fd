//! Single-flight deploy guard
//!
//! A deploy holds a [`DeployPermit`] for its whole run. Asking for a second
//! permit while one is alive fails with [`DeployError::Busy`]; nothing queues.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::DeployError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardState {
    Idle,
    Busy {
        config: String,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct DeployGuard {
    state: Arc<Mutex<GuardState>>,
}

impl DeployGuard {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::Idle)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        lock(&self.state)
    }

    /// Take the token, or fail if a deploy is already running
    pub fn try_acquire(&self, config: &str) -> Result<DeployPermit, DeployError> {
        let mut state = self.lock();
        if matches!(*state, GuardState::Busy { .. }) {
            return Err(DeployError::Busy);
        }
        *state = GuardState::Busy {
            config: config.to_string(),
            started_at: Utc::now(),
        };
        Ok(DeployPermit {
            state: self.state.clone(),
        })
    }

    pub fn state(&self) -> GuardState {
        self.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        matches!(*self.lock(), GuardState::Busy { .. })
    }
}

impl Default for DeployGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns the guard to idle when dropped
#[derive(Debug)]
pub struct DeployPermit {
    state: Arc<Mutex<GuardState>>,
}

impl Drop for DeployPermit {
    fn drop(&mut self) {
        *lock(&self.state) = GuardState::Idle;
    }
}
