//! Finite State Machine for a single deployment run

use serde::{Deserialize, Serialize};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    /// Nothing started yet
    Idle,

    /// Local build and SSH connect running concurrently
    BuildingAndConnecting,

    /// Artifacts moving to the remote host
    Transferring,

    /// Remote dependencies being checked or installed
    Reconciling,

    /// Environment written and the release switched live
    Activating,

    /// Supervised processes being reloaded
    Restarting,

    /// Finished successfully
    Done,

    /// Aborted by a fatal error
    Failed,
}

impl DeployState {
    /// Terminal states accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Done | DeployState::Failed)
    }
}

/// Input to the deployment FSM
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// Kick off build and connect
    Begin,

    /// Both the build and the connection completed
    Prepared,

    /// Transfer finished
    Transferred,

    /// Dependencies reconciled
    Reconciled,

    /// Release is live
    Activated,

    /// Processes restarted
    Restarted,

    /// A fatal error occurred
    Fail(String),
}

/// Deployment FSM.
///
/// Runs at most once: no state is re-entered and there is no transition out of
/// `Done` or `Failed`.
#[derive(Debug, Clone)]
pub struct DeployFsm {
    state: DeployState,
    error: Option<String>,
    history: Vec<DeployState>,
}

impl DeployFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: DeployState::Idle,
            error: None,
            history: vec![DeployState::Idle],
        }
    }

    /// Get current state
    pub fn state(&self) -> DeployState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[DeployState] {
        &self.history
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StageEvent) -> Result<DeployState, String> {
        let new_state = match (&self.state, &event) {
            (DeployState::Idle, StageEvent::Begin) => DeployState::BuildingAndConnecting,
            (DeployState::BuildingAndConnecting, StageEvent::Prepared) => {
                DeployState::Transferring
            }
            (DeployState::Transferring, StageEvent::Transferred) => DeployState::Reconciling,
            (DeployState::Reconciling, StageEvent::Reconciled) => DeployState::Activating,
            (DeployState::Activating, StageEvent::Activated) => DeployState::Restarting,
            (DeployState::Restarting, StageEvent::Restarted) => DeployState::Done,

            // Any middle state can fail
            (state, StageEvent::Fail(err))
                if !state.is_terminal() && *state != DeployState::Idle =>
            {
                self.error = Some(err.clone());
                DeployState::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        self.history.push(new_state);
        Ok(new_state)
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}
