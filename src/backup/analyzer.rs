//! Simulate-only pass that sizes up a mirror operation before anything on
//! the target is touched.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::output_parser::{RsyncEvent, StatField};
use super::pump::{OutputPump, StreamKind};
use super::supervisor::{CommandSpec, ProcessExit, ProcessSupervisor};
use super::worker::{UpdateSender, WorkerUpdate};
use super::{ChangeKind, DryRunResult, EngineError};

const MAX_ERROR_LINES: usize = 5;

/// Folds parser events from a dry run into counts.
#[derive(Debug, Clone, Default)]
pub struct DryRunAccumulator {
    total_files: Option<u64>,
    files_transferred: Option<u64>,
    deleted_files: Option<u64>,
    stats_seen: bool,
    transfer_lines: u64,
    delete_lines: u64,
    other_lines: u64,
    scan_lines: u64,
    error_lines: Vec<String>,
}

impl DryRunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, stream: StreamKind, event: &RsyncEvent) {
        match (stream, event) {
            (StreamKind::Stderr, event) => {
                if self.error_lines.len() < MAX_ERROR_LINES {
                    self.error_lines.push(event.line().to_string());
                }
            }
            (StreamKind::Stdout, RsyncEvent::Change { change, .. }) => match change.kind {
                ChangeKind::Transfer => self.transfer_lines += 1,
                ChangeKind::Delete => self.delete_lines += 1,
                ChangeKind::Other => self.other_lines += 1,
            },
            (StreamKind::Stdout, RsyncEvent::Stat { field, value, .. }) => {
                self.stats_seen = true;
                match field {
                    StatField::TotalFiles => self.total_files = Some(*value),
                    StatField::FilesTransferred => self.files_transferred = Some(*value),
                    StatField::DeletedFiles => self.deleted_files = Some(*value),
                }
            }
            (StreamKind::Stdout, RsyncEvent::ScanProgress { .. }) => self.scan_lines += 1,
            (StreamKind::Stdout, RsyncEvent::Text(_)) => {}
        }
    }

    /// Itemized lines of any kind seen so far.
    pub fn changes_seen(&self) -> u64 {
        self.transfer_lines + self.delete_lines + self.other_lines
    }

    pub fn lines_scanned(&self) -> u64 {
        self.scan_lines
    }

    /// Derives the result from an exited process.
    ///
    /// Stats win over line counts, except that a deletion stat of zero
    /// still defers to counted delete lines: rsync versions disagree on
    /// which label carries deletions.
    pub fn finish(&self, exit_code: i32) -> Result<DryRunResult, EngineError> {
        if exit_code != 0 && !self.stats_seen {
            let detail = if self.error_lines.is_empty() {
                format!("exit code {}", exit_code)
            } else {
                self.error_lines.join("\n")
            };
            return Err(EngineError::DryRunFailed(detail));
        }
        if !self.stats_seen && self.changes_seen() == 0 {
            return Err(EngineError::DryRunParseFailed);
        }
        if exit_code != 0 {
            warn!("Dry run exited with code {} but produced statistics, using them", exit_code);
        }

        let transfer_count = self.files_transferred.unwrap_or(self.transfer_lines);
        let deletion_count = match self.deleted_files {
            Some(n) if n > 0 => n,
            _ => self.delete_lines,
        };
        let total_source_count = self.total_files.unwrap_or(0);
        let needs_sync = transfer_count > 0 || deletion_count > 0 || self.changes_seen() > 0;

        Ok(DryRunResult {
            needs_sync,
            transfer_count,
            deletion_count,
            total_source_count,
        })
    }
}

/// Runs rsync in simulate mode and derives the dry-run counts. Scan
/// feedback goes out on `updates` and never affects the result.
pub async fn run_dry_run(
    supervisor: &ProcessSupervisor,
    spec: &CommandSpec,
    cancel: watch::Receiver<bool>,
    drain_grace: Duration,
    updates: &UpdateSender,
) -> Result<DryRunResult, EngineError> {
    let generation = updates.generation();
    if *cancel.borrow() {
        return Err(EngineError::CancelledByUser);
    }

    info!("Generation {}: starting dry run", generation);
    let channels = supervisor.start(spec).map_err(|e| match e {
        EngineError::LaunchFailed(detail) => EngineError::DryRunLaunchFailed(detail),
        other => other,
    })?;

    let mut pump = OutputPump::new(supervisor, channels, cancel, drain_grace);
    let mut accumulator = DryRunAccumulator::new();

    while let Some(batch) = pump.next_batch().await {
        for event in &batch.events {
            accumulator.observe(batch.stream, event);
        }
        updates.try_send(WorkerUpdate::Scanning {
            changes_seen: accumulator.changes_seen(),
            lines_scanned: accumulator.lines_scanned(),
        });
    }

    let exit = pump.exit();
    let termination_error = pump.termination_error().cloned();
    let cancelled = pump.cancel_requested();
    drop(pump);
    supervisor.cleanup();

    if let Some(e) = termination_error {
        return Err(e);
    }
    if cancelled {
        info!("Generation {}: dry run cancelled", generation);
        return Err(EngineError::CancelledByUser);
    }

    let result = match exit {
        Some(ProcessExit::Exited(code)) => accumulator.finish(code),
        _ => Err(EngineError::DryRunFailed("rsync exit status was lost".to_string())),
    };
    match &result {
        Ok(result) => debug!("Generation {}: dry run result {:?}", generation, result),
        Err(e) => warn!("Generation {}: {}", generation, e),
    }
    result
}
