use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::output_parser::RsyncEvent;
use super::pump::{OutputPump, StreamKind};
use super::report::ReportBuffer;
use super::supervisor::{CommandSpec, ProcessExit, ProcessSupervisor};
use super::{
    ChangeKind, DryRunResult, EngineError, Generation, OperationOutcome, OutcomeStatus,
};

/// What an operation task reports back to the orchestrator.
#[derive(Debug, Clone)]
pub enum WorkerUpdate {
    /// Informational dry-run feedback.
    Scanning { changes_seen: u64, lines_scanned: u64 },
    DryRunFinished(Result<DryRunResult, EngineError>),
    Progress {
        files_processed: u64,
        current_file_name: Option<String>,
        report_lines: Vec<String>,
    },
    SyncFinished(OperationOutcome),
}

#[derive(Debug)]
pub struct WorkerMessage {
    pub generation: Generation,
    pub update: WorkerUpdate,
}

/// Generation-tagged handle used by operation tasks to talk to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    generation: Generation,
    tx: mpsc::Sender<WorkerMessage>,
}

impl UpdateSender {
    pub fn new(generation: Generation, tx: mpsc::Sender<WorkerMessage>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Waits for room in the channel. Returns false once the orchestrator
    /// is gone.
    pub async fn send(&self, update: WorkerUpdate) -> bool {
        self.tx
            .send(WorkerMessage {
                generation: self.generation,
                update,
            })
            .await
            .is_ok()
    }

    /// Drops the update when the channel is full.
    pub fn try_send(&self, update: WorkerUpdate) -> bool {
        self.tx
            .try_send(WorkerMessage {
                generation: self.generation,
                update,
            })
            .is_ok()
    }
}

/// Running counters of the real pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressTracker {
    files_total: u64,
    files_processed: u64,
    current_file_name: Option<String>,
}

impl ProgressTracker {
    pub fn new(files_total: u64) -> Self {
        Self {
            files_total,
            ..Self::default()
        }
    }

    /// rsync may report a few more transfers than the dry run estimated, so
    /// the count never passes `files_total`.
    pub fn record_transfer(&mut self, path: &str) {
        self.files_processed = (self.files_processed + 1).min(self.files_total);
        self.current_file_name = Some(path.to_string());
    }

    pub fn files_processed(&self) -> u64 {
        self.files_processed
    }

    pub fn current_file_name(&self) -> Option<&str> {
        self.current_file_name.as_deref()
    }

    #[cfg(test)]
    pub fn fraction_complete(&self) -> f64 {
        fraction(self.files_processed, self.files_total)
    }
}

pub fn fraction(processed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (processed as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Drives the real, destructive rsync pass for one operation.
pub struct SyncWorker<'a> {
    supervisor: &'a ProcessSupervisor,
    updates: UpdateSender,
    drain_grace: Duration,
    report_max_lines: usize,
}

impl<'a> SyncWorker<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        updates: UpdateSender,
        drain_grace: Duration,
        report_max_lines: usize,
    ) -> Self {
        Self {
            supervisor,
            updates,
            drain_grace,
            report_max_lines,
        }
    }

    pub async fn run(
        &self,
        spec: &CommandSpec,
        files_total: u64,
        cancel: watch::Receiver<bool>,
    ) -> OperationOutcome {
        let generation = self.updates.generation();
        if *cancel.borrow() {
            info!("Generation {}: cancelled before sync started", generation);
            return OperationOutcome::new(OutcomeStatus::Cancelled);
        }

        info!("Generation {}: starting sync of {} files", generation, files_total);
        let channels = match self.supervisor.start(spec) {
            Ok(channels) => channels,
            Err(e) => {
                error!("Generation {}: {}", generation, e);
                return OperationOutcome::failed(&e);
            }
        };

        let mut pump = OutputPump::new(self.supervisor, channels, cancel, self.drain_grace);
        let mut tracker = ProgressTracker::new(files_total);
        let mut report = ReportBuffer::new(self.report_max_lines);

        while let Some(batch) = pump.next_batch().await {
            for event in &batch.events {
                match batch.stream {
                    StreamKind::Stdout => {
                        if let RsyncEvent::Change { change, .. } = event {
                            if change.kind == ChangeKind::Transfer {
                                tracker.record_transfer(&change.path);
                            }
                        }
                        report.push_line(event.line());
                    }
                    StreamKind::Stderr => {
                        report.push_error(event.line());
                    }
                }
            }

            let update = WorkerUpdate::Progress {
                files_processed: tracker.files_processed(),
                current_file_name: tracker.current_file_name().map(str::to_string),
                report_lines: report.take_pending(),
            };
            if !self.updates.send(update).await {
                debug!("Generation {}: orchestrator gone, progress dropped", generation);
            }
        }

        let exit = pump.exit();
        let termination_error = pump.termination_error().cloned();
        let cancelled = pump.cancel_requested();
        drop(pump);
        self.supervisor.cleanup();

        let mut outcome = match (termination_error, exit) {
            (Some(e), _) => {
                error!("Generation {}: {}", generation, e);
                OperationOutcome::failed(&e)
            }
            (None, Some(ProcessExit::Exited(code))) => {
                let mut outcome = if cancelled {
                    info!("Generation {}: sync cancelled (exit code {})", generation, code);
                    OperationOutcome::new(OutcomeStatus::Cancelled)
                } else if code == 0 && !report.has_errors() {
                    info!("Generation {}: sync completed", generation);
                    OperationOutcome::new(OutcomeStatus::Success)
                } else {
                    let detail = report
                        .error_text()
                        .unwrap_or_else(|| format!("exit code {}", code));
                    warn!("Generation {}: sync failed: {}", generation, detail);
                    OperationOutcome {
                        error_text: Some(detail),
                        ..OperationOutcome::new(OutcomeStatus::Failed)
                    }
                };
                outcome.exit_code = Some(code);
                outcome
            }
            (None, _) => {
                let e = EngineError::SyncFailed("rsync exit status was lost".to_string());
                error!("Generation {}: {}", generation, e);
                OperationOutcome::failed(&e)
            }
        };

        outcome.report_text = report.text();
        outcome.files_processed = tracker.files_processed();
        outcome
    }
}
