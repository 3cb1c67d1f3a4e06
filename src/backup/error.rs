//! Error types for the sync engine.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A sync operation is already in progress")]
    Busy,

    #[error("Cannot {command} while {state}")]
    InvalidCommand { command: &'static str, state: String },

    #[error("An external process is already active")]
    ProcessAlreadyActive,

    #[error("No external process is running")]
    NotRunning,

    #[error("Failed to launch rsync: {0}")]
    LaunchFailed(String),

    #[error("Failed to launch dry run: {0}")]
    DryRunLaunchFailed(String),

    #[error("Dry run failed: {0}")]
    DryRunFailed(String),

    #[error("Dry run output could not be interpreted; refusing to proceed")]
    DryRunParseFailed,

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Process termination failed: {0}")]
    ProcessTerminationFailed(String),

    #[error("Cancelled by user")]
    CancelledByUser,

    #[error("Sync engine has stopped")]
    EngineStopped,
}

impl EngineError {
    /// User cancellation is a terminal outcome, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancelledByUser)
    }
}

impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
