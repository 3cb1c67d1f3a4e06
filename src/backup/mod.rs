pub mod analyzer;
pub mod error;
pub mod history;
pub mod manager;
pub mod output_parser;
pub mod pump;
pub mod report;
pub mod rsync;
pub mod safety;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub(crate) mod fake_process;

pub use error::EngineError;
pub use history::HistorySink;
pub use manager::{BackupManager, Event, StatusSnapshot};
pub use safety::DeletionGate;
pub use supervisor::{ProcessSupervisor, SystemLauncher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Monotonic tag of one start-to-terminal operation.
pub type Generation = u64;

/// Source and target of one mirror operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl SyncRequest {
    /// Validates the structural invariants of a request. Existence and
    /// permission checks belong to the caller that picked the directories.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let source = source.into();
        let target = target.into();

        if !source.is_absolute() {
            return Err(EngineError::InvalidRequest(format!(
                "source path must be absolute: {}",
                source.display()
            )));
        }
        if !target.is_absolute() {
            return Err(EngineError::InvalidRequest(format!(
                "target path must be absolute: {}",
                target.display()
            )));
        }
        if strip_separators(&source) == strip_separators(&target) {
            return Err(EngineError::InvalidRequest(format!(
                "source and target are the same directory: {}",
                source.display()
            )));
        }

        Ok(Self { source, target })
    }
}

fn strip_separators(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Counts derived from the simulate-only pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub needs_sync: bool,
    pub transfer_count: u64,
    pub deletion_count: u64,
    pub total_source_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Transfer,
    Delete,
    Other,
}

/// One itemized change line reported by rsync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemizedChange {
    pub kind: ChangeKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Idle,
    Calculating,
    AwaitingConfirmation,
    Syncing,
    Completed,
    Failed,
    Cancelled,
}

impl BackupState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States from which a new request may begin.
    pub fn accepts_start(self) -> bool {
        self == Self::Idle || self.is_terminal()
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Calculating => "calculating",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Live progress, written only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub phase: BackupState,
    pub files_processed: u64,
    pub files_total: u64,
    pub current_file_name: Option<String>,
    pub fraction_complete: f64,
    pub message: String,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            phase: BackupState::Idle,
            files_processed: 0,
            files_total: 0,
            current_file_name: None,
            fraction_complete: 0.0,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal value of one operation, handed to the history collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    pub error_text: Option<String>,
    pub report_text: String,
    pub files_processed: u64,
    pub finished_at: DateTime<Utc>,
}

impl OperationOutcome {
    pub fn new(status: OutcomeStatus) -> Self {
        Self {
            status,
            exit_code: None,
            error_text: None,
            report_text: String::new(),
            files_processed: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: &EngineError) -> Self {
        Self {
            error_text: Some(error.to_string()),
            ..Self::new(OutcomeStatus::Failed)
        }
    }

    pub fn state(&self) -> BackupState {
        match self.status {
            OutcomeStatus::Success => BackupState::Completed,
            OutcomeStatus::Failed => BackupState::Failed,
            OutcomeStatus::Cancelled => BackupState::Cancelled,
        }
    }
}
