use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::analyzer::run_dry_run;
use super::history::HistorySink;
use super::report::ReportBuffer;
use super::rsync::RsyncCommand;
use super::safety::{DeletionGate, GateDecision};
use super::supervisor::{ProcessLauncher, ProcessSupervisor};
use super::worker::{fraction, SyncWorker, UpdateSender, WorkerMessage, WorkerUpdate};
use super::{
    BackupState, DryRunResult, EngineError, Generation, OperationOutcome, OutcomeStatus,
    ProgressState, SyncRequest,
};
use crate::utils::config::Config;

/// Handle to the sync engine. Clones share one orchestrator task.
#[derive(Clone)]
pub struct BackupManager {
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<Event>,
    shared: Arc<RwLock<EngineState>>,
    shutdown_wait: Duration,
    #[cfg(test)]
    supervisor: Arc<ProcessSupervisor>,
}

#[derive(Debug)]
enum Command {
    Start {
        request: SyncRequest,
        reply: oneshot::Sender<Result<Generation, EngineError>>,
    },
    ConfirmDeletion {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Everything observers are told, tagged with the operation it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        generation: Generation,
        state: BackupState,
    },
    Progress {
        generation: Generation,
        progress: ProgressState,
        report_lines: Vec<String>,
    },
    ConfirmationRequired {
        generation: Generation,
        dry_run: DryRunResult,
        deletion_percentage: f64,
    },
    Finished {
        generation: Generation,
        outcome: OperationOutcome,
    },
    Error {
        generation: Generation,
        message: String,
    },
}

/// Immutable view of the engine handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: BackupState,
    pub generation: Generation,
    pub request: Option<SyncRequest>,
    pub progress: ProgressState,
    pub dry_run: Option<DryRunResult>,
    pub deletion_percentage: Option<f64>,
    pub report: String,
    pub error: Option<String>,
    pub last_outcome: Option<OperationOutcome>,
}

struct EngineState {
    state: BackupState,
    generation: Generation,
    request: Option<SyncRequest>,
    progress: ProgressState,
    dry_run: Option<DryRunResult>,
    deletion_percentage: Option<f64>,
    report: ReportBuffer,
    error: Option<String>,
    last_outcome: Option<OperationOutcome>,
}

impl EngineState {
    fn new(report_max_lines: usize) -> Self {
        Self {
            state: BackupState::Idle,
            generation: 0,
            request: None,
            progress: ProgressState::default(),
            dry_run: None,
            deletion_percentage: None,
            report: ReportBuffer::new(report_max_lines),
            error: None,
            last_outcome: None,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            generation: self.generation,
            request: self.request.clone(),
            progress: self.progress.clone(),
            dry_run: self.dry_run,
            deletion_percentage: self.deletion_percentage,
            report: self.report.text(),
            error: self.error.clone(),
            last_outcome: self.last_outcome.clone(),
        }
    }
}

impl BackupManager {
    pub fn new(config: Config, launcher: Arc<dyn ProcessLauncher>, history: Arc<dyn HistorySink>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (worker_tx, worker_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(512);
        let shared = Arc::new(RwLock::new(EngineState::new(config.report_max_lines)));

        let escalation = config.escalation();
        let shutdown_wait =
            escalation.terminate_grace + escalation.kill_grace + config.drain_grace() + Duration::from_secs(1);

        let supervisor = Arc::new(ProcessSupervisor::new(launcher, escalation));
        let engine = Engine::new(
            Arc::new(config),
            supervisor.clone(),
            history,
            shared.clone(),
            event_tx.clone(),
            worker_tx,
        );
        tokio::spawn(engine.run(command_rx, worker_rx));

        Self {
            command_tx,
            event_tx,
            shared,
            shutdown_wait,
            #[cfg(test)]
            supervisor,
        }
    }

    /// Begins a new operation and returns its generation.
    pub async fn start(&self, request: SyncRequest) -> Result<Generation, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { request, reply }).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn confirm_deletion(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConfirmDeletion { reply }).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn cancel(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { reply }).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }

    pub fn get_status(&self) -> StatusSnapshot {
        self.shared.read().snapshot()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Cancels any in-flight operation and waits, bounded, for it to end.
    pub async fn shutdown(&self) {
        let mut events = self.subscribe_events();
        if self.get_status().state.accepts_start() {
            return;
        }

        info!("Cancelling in-flight operation before shutdown");
        if let Err(e) = self.cancel().await {
            debug!("Shutdown cancel: {}", e);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(Event::Finished { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.get_status().state.accepts_start() {
                            break;
                        }
                    }
                }
            }
        };
        if tokio::time::timeout(self.shutdown_wait, wait).await.is_err() {
            warn!(
                "Operation still running after {}",
                humantime::format_duration(self.shutdown_wait)
            );
        }
    }
}

struct Operation {
    generation: Generation,
    request: SyncRequest,
    cancel_tx: watch::Sender<bool>,
    dry_run: Option<DryRunResult>,
}

/// The orchestrator task. Sole writer of `EngineState`.
struct Engine {
    config: Arc<Config>,
    rsync: RsyncCommand,
    gate: DeletionGate,
    supervisor: Arc<ProcessSupervisor>,
    history: Arc<dyn HistorySink>,
    shared: Arc<RwLock<EngineState>>,
    event_tx: broadcast::Sender<Event>,
    worker_tx: mpsc::Sender<WorkerMessage>,
    generation: Generation,
    current: Option<Operation>,
}

impl Engine {
    fn new(
        config: Arc<Config>,
        supervisor: Arc<ProcessSupervisor>,
        history: Arc<dyn HistorySink>,
        shared: Arc<RwLock<EngineState>>,
        event_tx: broadcast::Sender<Event>,
        worker_tx: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            rsync: RsyncCommand::from_config(&config),
            gate: config.deletion_gate(),
            supervisor,
            config,
            history,
            shared,
            event_tx,
            worker_tx,
            generation: 0,
            current: None,
        }
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut worker_rx: mpsc::Receiver<WorkerMessage>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = worker_rx.recv() => self.handle_worker(message).await,
            }
        }

        if let Some(operation) = &self.current {
            info!("Engine handle dropped, cancelling generation {}", operation.generation);
            operation.cancel_tx.send_replace(true);
        }
        debug!("Orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            Command::ConfirmDeletion { reply } => {
                let _ = reply.send(self.confirm_deletion());
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel().await);
            }
        }
    }

    fn state(&self) -> BackupState {
        self.shared.read().state
    }

    fn start(&mut self, request: SyncRequest) -> Result<Generation, EngineError> {
        let state = self.state();
        if self.current.is_some() || !state.accepts_start() {
            warn!("Rejecting start while {}", state);
            return Err(EngineError::Busy);
        }

        self.generation += 1;
        let generation = self.generation;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        info!(
            "Generation {}: mirroring {} -> {}",
            generation,
            request.source.display(),
            request.target.display()
        );

        {
            let mut shared = self.shared.write();
            shared.generation = generation;
            shared.request = Some(request.clone());
            shared.dry_run = None;
            shared.deletion_percentage = None;
            shared.report.clear();
            shared.error = None;
            shared.progress = ProgressState {
                phase: BackupState::Calculating,
                message: "Analyzing changes...".to_string(),
                ..ProgressState::default()
            };
        }
        self.current = Some(Operation {
            generation,
            request: request.clone(),
            cancel_tx,
            dry_run: None,
        });
        self.transition(BackupState::Calculating);

        let supervisor = self.supervisor.clone();
        let spec = self.rsync.dry_run(&request);
        let drain_grace = self.config.drain_grace();
        let updates = UpdateSender::new(generation, self.worker_tx.clone());
        tokio::spawn(async move {
            let result = run_dry_run(&supervisor, &spec, cancel_rx, drain_grace, &updates).await;
            updates.send(WorkerUpdate::DryRunFinished(result)).await;
        });

        Ok(generation)
    }

    fn confirm_deletion(&mut self) -> Result<(), EngineError> {
        let state = self.state();
        if state != BackupState::AwaitingConfirmation {
            return Err(EngineError::InvalidCommand {
                command: "confirm deletion",
                state: state.to_string(),
            });
        }
        info!("Deletion confirmed by user");
        self.begin_sync();
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), EngineError> {
        let state = self.state();
        match state {
            BackupState::AwaitingConfirmation => {
                info!("Deletion declined, nothing was changed");
                let mut outcome = OperationOutcome::new(OutcomeStatus::Cancelled);
                outcome.report_text = "Cancelled before any changes were made.\n".to_string();
                self.finish(outcome).await;
                Ok(())
            }
            BackupState::Calculating | BackupState::Syncing => {
                let Some(operation) = &self.current else {
                    return Err(EngineError::NotRunning);
                };
                if operation.cancel_tx.send_replace(true) {
                    debug!("Cancel already requested for generation {}", operation.generation);
                    return Ok(());
                }
                info!("Cancelling generation {} while {}", operation.generation, state);
                let progress = {
                    let mut shared = self.shared.write();
                    shared.progress.message = "Cancelling...".to_string();
                    shared.progress.clone()
                };
                self.publish(Event::Progress {
                    generation: self.generation,
                    progress,
                    report_lines: Vec::new(),
                });
                Ok(())
            }
            _ => Err(EngineError::InvalidCommand {
                command: "cancel",
                state: state.to_string(),
            }),
        }
    }

    async fn handle_worker(&mut self, message: WorkerMessage) {
        let current = self.current.as_ref().map(|op| op.generation);
        if current != Some(message.generation) {
            debug!(
                "Discarding stale update from generation {} (current {:?})",
                message.generation, current
            );
            return;
        }

        match message.update {
            WorkerUpdate::Scanning { changes_seen, lines_scanned } => {
                if self.state() != BackupState::Calculating {
                    return;
                }
                let progress = {
                    let mut shared = self.shared.write();
                    shared.progress.message = if changes_seen > 0 {
                        format!("Analyzing changes... {} found", changes_seen)
                    } else {
                        format!("Analyzing changes... ({} scan steps)", lines_scanned)
                    };
                    shared.progress.clone()
                };
                self.publish(Event::Progress {
                    generation: message.generation,
                    progress,
                    report_lines: Vec::new(),
                });
            }
            WorkerUpdate::DryRunFinished(result) => self.on_dry_run(result).await,
            WorkerUpdate::Progress {
                files_processed,
                current_file_name,
                report_lines,
            } => {
                if self.state() != BackupState::Syncing {
                    return;
                }
                let progress = {
                    let mut shared = self.shared.write();
                    let progress = &mut shared.progress;
                    progress.files_processed = progress.files_processed.max(files_processed);
                    progress.fraction_complete = fraction(progress.files_processed, progress.files_total);
                    if current_file_name.is_some() {
                        progress.current_file_name = current_file_name;
                    }
                    let progress = progress.clone();
                    for line in &report_lines {
                        shared.report.push_line(line);
                    }
                    progress
                };
                self.publish(Event::Progress {
                    generation: message.generation,
                    progress,
                    report_lines,
                });
            }
            WorkerUpdate::SyncFinished(outcome) => self.finish(outcome).await,
        }
    }

    async fn on_dry_run(&mut self, result: Result<DryRunResult, EngineError>) {
        // A stop that lands after the result was queued still wins.
        let cancel_requested = self
            .current
            .as_ref()
            .map_or(false, |operation| *operation.cancel_tx.borrow());
        if cancel_requested {
            info!("Cancel requested before the dry run result was handled");
            self.finish(OperationOutcome::new(OutcomeStatus::Cancelled)).await;
            return;
        }

        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_cancellation() => {
                self.finish(OperationOutcome::new(OutcomeStatus::Cancelled)).await;
                return;
            }
            Err(e) => {
                self.finish(OperationOutcome::failed(&e)).await;
                return;
            }
        };

        info!(
            "Dry run: {} to transfer, {} to delete, {} in source",
            result.transfer_count, result.deletion_count, result.total_source_count
        );
        if let Some(operation) = self.current.as_mut() {
            operation.dry_run = Some(result);
        }
        self.shared.write().dry_run = Some(result);

        if !result.needs_sync {
            let mut outcome = OperationOutcome::new(OutcomeStatus::Success);
            outcome.exit_code = Some(0);
            outcome.report_text = "Source and target are already in sync.\n".to_string();
            self.finish(outcome).await;
            return;
        }

        match self.gate.evaluate(&result) {
            GateDecision::Proceed => self.begin_sync(),
            GateDecision::ConfirmationRequired { deletion_fraction } => {
                let deletion_percentage = deletion_fraction * 100.0;
                warn!(
                    "{} deletions ({:.1}% of source) need confirmation",
                    result.deletion_count, deletion_percentage
                );
                {
                    let mut shared = self.shared.write();
                    shared.deletion_percentage = Some(deletion_percentage);
                    shared.progress.message = format!(
                        "{} files will be deleted ({:.1}% of source)",
                        result.deletion_count, deletion_percentage
                    );
                }
                self.transition(BackupState::AwaitingConfirmation);
                self.publish(Event::ConfirmationRequired {
                    generation: self.generation,
                    dry_run: result,
                    deletion_percentage,
                });
            }
        }
    }

    fn begin_sync(&mut self) {
        let Some(operation) = &self.current else {
            error!("No operation to sync");
            return;
        };
        let files_total = operation.dry_run.map(|r| r.transfer_count).unwrap_or(0);
        let spec = self.rsync.sync(&operation.request);
        let cancel_rx = operation.cancel_tx.subscribe();
        let generation = operation.generation;

        {
            let mut shared = self.shared.write();
            shared.progress = ProgressState {
                phase: BackupState::Syncing,
                files_total,
                message: "Syncing...".to_string(),
                ..ProgressState::default()
            };
        }
        self.transition(BackupState::Syncing);

        let supervisor = self.supervisor.clone();
        let updates = UpdateSender::new(generation, self.worker_tx.clone());
        let drain_grace = self.config.drain_grace();
        let report_max_lines = self.config.report_max_lines;
        tokio::spawn(async move {
            let outcome = SyncWorker::new(&supervisor, updates.clone(), drain_grace, report_max_lines)
                .run(&spec, files_total, cancel_rx)
                .await;
            updates.send(WorkerUpdate::SyncFinished(outcome)).await;
        });
    }

    async fn finish(&mut self, outcome: OperationOutcome) {
        let Some(operation) = self.current.take() else {
            error!("Outcome arrived with no operation in flight");
            return;
        };
        let state = outcome.state();
        info!("Generation {}: {} ({})", operation.generation, state, outcome.status.as_str());

        {
            let mut shared = self.shared.write();
            shared.progress.phase = state;
            shared.progress.files_processed = shared.progress.files_processed.max(outcome.files_processed);
            if outcome.status == OutcomeStatus::Success {
                shared.progress.fraction_complete = 1.0;
            }
            shared.progress.message = match (&outcome.status, &outcome.error_text) {
                (OutcomeStatus::Success, _) => "Completed".to_string(),
                (OutcomeStatus::Cancelled, _) => "Cancelled".to_string(),
                (OutcomeStatus::Failed, Some(text)) => text.clone(),
                (OutcomeStatus::Failed, None) => "Failed".to_string(),
            };
            if !outcome.report_text.is_empty() {
                shared.report.clear();
                for line in outcome.report_text.lines() {
                    shared.report.push_line(line);
                }
            }
            shared.error = outcome.error_text.clone();
            shared.last_outcome = Some(outcome.clone());
            shared.state = state;
        }

        if let Err(e) = self.history.record(&operation.request, &outcome).await {
            error!("Failed to record sync history: {:#}", e);
        }

        if let Some(message) = &outcome.error_text {
            self.publish(Event::Error {
                generation: operation.generation,
                message: message.clone(),
            });
        }
        self.publish(Event::StateChanged {
            generation: operation.generation,
            state,
        });
        self.publish(Event::Finished {
            generation: operation.generation,
            outcome,
        });
    }

    fn transition(&self, state: BackupState) {
        {
            let mut shared = self.shared.write();
            debug!("State {} -> {}", shared.state, state);
            shared.state = state;
            shared.progress.phase = state;
        }
        self.publish(Event::StateChanged {
            generation: self.generation,
            state,
        });
    }

    fn publish(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
