//! Error types for the koram deployer

use thiserror::Error;

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The local build exited non-zero. `exit_code` is -1 when the process was killed by a signal.
    #[error("Build command '{command}' failed with exit code {exit_code}")]
    BuildError { command: String, exit_code: i32 },

    #[error("SSH connection to {host} failed: {reason}")]
    ConnectError { host: String, reason: String },

    #[error("Build output directory not found: {0}")]
    MissingOutputError(String),

    #[error("Transfer of {artifact} failed: {reason}")]
    TransferError { artifact: String, reason: String },

    #[error("Packaging error: {0}")]
    PackagingError(String),

    #[error("Dependency install failed after clean reinstall: {0}")]
    InstallError(String),

    #[error("Native module rebuild failed: {0}")]
    RebuildWarning(String),

    #[error("Release activation failed: {0}")]
    ActivationError(String),

    #[error("Process '{name}' failed to restart: {reason}")]
    ProcessRestartError { name: String, reason: String },

    #[error("Remote command error: {0}")]
    RemoteError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("A deployment is already in progress")]
    Busy,

    #[error("Invalid state transition: {0}")]
    StateError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether this error aborts the deployment when it reaches the orchestrator
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DeployError::RebuildWarning(_) | DeployError::ProcessRestartError { .. }
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DeployError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeployError::Internal(err.to_string())
    }
}
