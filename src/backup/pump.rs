use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::output_parser::{OutputParser, RsyncEvent};
use super::supervisor::{CancelOutcome, ProcessChannels, ProcessExit, ProcessSupervisor};
use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Events parsed from one chunk of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub stream: StreamKind,
    pub events: Vec<RsyncEvent>,
}

/// Single consumer of a running process: drains both output channels,
/// parses them, escalates cancellation when asked, and after exit keeps
/// draining for `drain_grace` before flushing partial lines. Output keeps
/// flowing while an escalation is in progress.
pub struct OutputPump<'a> {
    supervisor: &'a ProcessSupervisor,
    stdout_rx: Option<mpsc::Receiver<Bytes>>,
    stderr_rx: Option<mpsc::Receiver<Bytes>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    stdout: OutputParser,
    stderr: OutputParser,
    cancel: watch::Receiver<bool>,
    cancel_sent: bool,
    cancel_closed: bool,
    cancelling: Option<BoxFuture<'a, Result<CancelOutcome, EngineError>>>,
    drain_grace: Duration,
    exit: Option<ProcessExit>,
    termination_error: Option<EngineError>,
    deadline: Option<Instant>,
    queued: VecDeque<Batch>,
    finished: bool,
}

impl<'a> OutputPump<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        channels: ProcessChannels,
        cancel: watch::Receiver<bool>,
        drain_grace: Duration,
    ) -> Self {
        Self {
            supervisor,
            stdout_rx: channels.stdout,
            stderr_rx: channels.stderr,
            exit_rx: channels.exit,
            stdout: OutputParser::new(),
            stderr: OutputParser::new(),
            cancel,
            cancel_sent: false,
            cancel_closed: false,
            cancelling: None,
            drain_grace,
            exit: None,
            termination_error: None,
            deadline: None,
            queued: VecDeque::new(),
            finished: false,
        }
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit
    }

    /// Set when cancellation gave up on the process.
    pub fn termination_error(&self) -> Option<&EngineError> {
        self.termination_error.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_sent || *self.cancel.borrow()
    }

    /// Next batch of events, or `None` once the process has exited and
    /// its output has been drained.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        loop {
            if let Some(batch) = self.queued.pop_front() {
                return Some(batch);
            }
            if self.finished {
                // Settle the escalation so its result is not lost.
                if let Some(cancelling) = self.cancelling.take() {
                    let result = cancelling.await;
                    self.on_cancel_result(result);
                    continue;
                }
                return None;
            }

            if self.exit.is_none() {
                let current = *self.exit_rx.borrow();
                if let Some(exit) = current {
                    self.mark_exited(exit);
                }
            }
            if self.exit.is_none() && !self.cancel_sent && *self.cancel.borrow() {
                self.request_cancel();
            }
            if self.exit.is_some() && self.stdout_rx.is_none() && self.stderr_rx.is_none() {
                self.flush();
                continue;
            }

            let exit_pending = self.exit.is_none();
            let watch_cancel = exit_pending && !self.cancel_sent && !self.cancel_closed;
            let deadline = self.deadline;

            tokio::select! {
                changed = self.cancel.changed(), if watch_cancel => {
                    if changed.is_err() {
                        self.cancel_closed = true;
                    }
                }
                result = drive_cancel(&mut self.cancelling) => {
                    self.cancelling = None;
                    self.on_cancel_result(result);
                }
                chunk = recv_chunk(&mut self.stdout_rx) => {
                    self.on_chunk(StreamKind::Stdout, chunk);
                }
                chunk = recv_chunk(&mut self.stderr_rx) => {
                    self.on_chunk(StreamKind::Stderr, chunk);
                }
                changed = self.exit_rx.changed(), if exit_pending => {
                    let exit = match changed {
                        Ok(()) => *self.exit_rx.borrow_and_update(),
                        Err(_) => {
                            warn!("Process exit channel closed without an exit status");
                            Some(ProcessExit::TerminationFailed)
                        }
                    };
                    if let Some(exit) = exit {
                        self.mark_exited(exit);
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    debug!("Drain grace elapsed with output still pending");
                    self.flush();
                }
            }
        }
    }

    fn mark_exited(&mut self, exit: ProcessExit) {
        debug!("Process exit observed: {:?}", exit);
        self.exit = Some(exit);
        self.deadline = Some(Instant::now() + self.drain_grace);
    }

    fn request_cancel(&mut self) {
        self.cancel_sent = true;
        let supervisor = self.supervisor;
        self.cancelling = Some(Box::pin(supervisor.cancel()));
    }

    fn on_cancel_result(&mut self, result: Result<CancelOutcome, EngineError>) {
        match result {
            Ok(outcome) => debug!("Cancellation finished: {:?}", outcome),
            Err(e @ EngineError::ProcessTerminationFailed(_)) => {
                warn!("Cancellation could not be confirmed: {}", e);
                self.termination_error = Some(e);
            }
            Err(e) => debug!("Cancellation not delivered: {}", e),
        }
    }

    fn on_chunk(&mut self, stream: StreamKind, chunk: Option<Bytes>) {
        let Some(chunk) = chunk else {
            match stream {
                StreamKind::Stdout => self.stdout_rx = None,
                StreamKind::Stderr => self.stderr_rx = None,
            }
            return;
        };

        let events = match stream {
            StreamKind::Stdout => self.stdout.push(&chunk),
            StreamKind::Stderr => self.stderr.push(&chunk),
        };
        self.enqueue(stream, events);
    }

    fn flush(&mut self) {
        let stdout = self.stdout.finish();
        self.enqueue(StreamKind::Stdout, stdout);
        let stderr = self.stderr.finish();
        self.enqueue(StreamKind::Stderr, stderr);
        self.stdout_rx = None;
        self.stderr_rx = None;
        self.finished = true;
    }

    fn enqueue(&mut self, stream: StreamKind, events: Vec<RsyncEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            match stream {
                StreamKind::Stdout => debug!("rsync: {}", event.line()),
                StreamKind::Stderr => warn!("rsync stderr: {}", event.line()),
            }
        }
        self.queued.push_back(Batch { stream, events });
    }
}

async fn recv_chunk(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drive_cancel(
    cancelling: &mut Option<BoxFuture<'_, Result<CancelOutcome, EngineError>>>,
) -> Result<CancelOutcome, EngineError> {
    match cancelling {
        Some(cancelling) => cancelling.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fake_process::{FakeExit, FakeLauncher, FakeScript};
    use crate::backup::supervisor::{CommandSpec, EscalationTimings, Signal};
    use crate::backup::ChangeKind;
    use std::sync::Arc;

    fn spec() -> CommandSpec {
        CommandSpec {
            program: "rsync".into(),
            args: Vec::new(),
        }
    }

    async fn collect(pump: &mut OutputPump<'_>) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = pump.next_batch().await {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test(start_paused = true)]
    async fn drains_both_streams_and_flushes_partial_line() {
        let launcher = FakeLauncher::new();
        launcher.push(
            FakeScript::new()
                .stdout(">f+++++++++ a.txt\n>f+++")
                .stdout("++++++ b.txt\nNumber of files: 2")
                .stderr("rsync: warning\n")
                .exit(FakeExit::Code(0)),
        );
        let supervisor = ProcessSupervisor::new(Arc::new(launcher.clone()), EscalationTimings::default());
        let channels = supervisor.start(&spec()).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut pump = OutputPump::new(&supervisor, channels, cancel_rx, Duration::from_millis(250));
        let batches = collect(&mut pump).await;

        let stdout: Vec<_> = batches
            .iter()
            .filter(|b| b.stream == StreamKind::Stdout)
            .flat_map(|b| b.events.clone())
            .collect();
        let stderr: Vec<_> = batches
            .iter()
            .filter(|b| b.stream == StreamKind::Stderr)
            .flat_map(|b| b.events.clone())
            .collect();

        let transfers: Vec<_> = stdout
            .iter()
            .filter_map(|e| match e {
                RsyncEvent::Change { change, .. } if change.kind == ChangeKind::Transfer => Some(change.path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(transfers, vec!["a.txt", "b.txt"]);
        assert!(matches!(stdout.last(), Some(RsyncEvent::Stat { value: 2, .. })));
        assert_eq!(stderr, vec![RsyncEvent::Text("rsync: warning".to_string())]);
        assert_eq!(pump.exit(), Some(ProcessExit::Exited(0)));
        assert!(!pump.cancel_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_flag_escalates_through_supervisor() {
        let launcher = FakeLauncher::new();
        launcher.push(FakeScript::new().stdout(">f+++++++++ a.txt\n").exit(FakeExit::OnTerminate));
        let supervisor = ProcessSupervisor::new(Arc::new(launcher.clone()), EscalationTimings::default());
        let channels = supervisor.start(&spec()).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut pump = OutputPump::new(&supervisor, channels, cancel_rx, Duration::from_millis(250));
        let first = pump.next_batch().await.unwrap();
        assert_eq!(first.events.len(), 1);

        cancel_tx.send_replace(true);
        assert!(collect(&mut pump).await.is_empty());
        assert_eq!(pump.exit(), Some(ProcessExit::Exited(143)));
        assert!(pump.cancel_requested());
        assert_eq!(launcher.signals(), vec![Signal::Terminate]);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_process_ends_pump_with_termination_failure() {
        let launcher = FakeLauncher::new();
        launcher.push(FakeScript::new().exit(FakeExit::Never));
        let supervisor = ProcessSupervisor::new(Arc::new(launcher.clone()), EscalationTimings::default());
        let channels = supervisor.start(&spec()).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(true);

        let mut pump = OutputPump::new(&supervisor, channels, cancel_rx, Duration::from_millis(250));
        assert!(collect(&mut pump).await.is_empty());
        assert_eq!(pump.exit(), Some(ProcessExit::TerminationFailed));
        assert!(matches!(
            pump.termination_error(),
            Some(EngineError::ProcessTerminationFailed(_))
        ));
        assert_eq!(launcher.signals(), vec![Signal::Terminate, Signal::Kill]);
    }

    #[tokio::test(start_paused = true)]
    async fn output_keeps_flowing_while_cancellation_escalates() {
        const SIGTERM_NOTICE: &str = "rsync error: received SIGINT, SIGTERM, or SIGHUP (code 20)";
        let launcher = FakeLauncher::new();
        launcher.push(
            FakeScript::new()
                .stdout(">f+++++++++ a.txt\n")
                .on_terminate_stderr(format!("{}\n", SIGTERM_NOTICE))
                .exit(FakeExit::OnKill),
        );
        let supervisor = ProcessSupervisor::new(Arc::new(launcher.clone()), EscalationTimings::default());
        let channels = supervisor.start(&spec()).unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut pump = OutputPump::new(&supervisor, channels, cancel_rx, Duration::from_millis(250));
        let first = pump.next_batch().await.unwrap();
        assert_eq!(first.stream, StreamKind::Stdout);

        let started = Instant::now();
        cancel_tx.send_replace(true);
        let notice = pump.next_batch().await.unwrap();
        assert_eq!(notice.stream, StreamKind::Stderr);
        assert_eq!(notice.events, vec![RsyncEvent::Text(SIGTERM_NOTICE.to_string())]);
        // Delivered before the graceful window ran out.
        assert!(started.elapsed() < Duration::from_millis(500));

        assert!(collect(&mut pump).await.is_empty());
        assert_eq!(pump.exit(), Some(ProcessExit::Exited(137)));
        assert!(pump.termination_error().is_none());
        assert_eq!(launcher.signals(), vec![Signal::Terminate, Signal::Kill]);
    }
}
