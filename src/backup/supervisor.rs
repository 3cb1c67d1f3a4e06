//! Lifecycle of the single external rsync process.
//!
//! `Idle -> Starting -> Running -> (Terminating ->) Terminated`, then
//! `cleanup()` returns to `Idle`. Output pipes are forwarded through
//! bounded channels so exactly one consumer ever touches the bytes.

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::EngineError;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Program and arguments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

pub trait ProcessSignaller: Send + Sync {
    fn signal(&self, signal: Signal) -> io::Result<()>;
}

/// A launched process split into the pieces the supervisor owns.
pub struct SpawnedProcess {
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub signaller: Arc<dyn ProcessSignaller>,
    /// Resolves with the exit code once the process is gone.
    pub exit: BoxFuture<'static, io::Result<i32>>,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> io::Result<SpawnedProcess>;
}

/// Launches real OS processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<SpawnedProcess> {
        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|s| Box::pin(s) as BoxedReader);
        let stderr = child.stderr.take().map(|s| Box::pin(s) as BoxedReader);
        let exited = Arc::new(AtomicBool::new(false));
        let signaller = Arc::new(PidSignaller {
            pid: child.id(),
            exited: exited.clone(),
        });

        let exit = Box::pin(async move {
            let status = child.wait().await;
            exited.store(true, Ordering::SeqCst);
            status.map(exit_code)
        });

        Ok(SpawnedProcess {
            stdout,
            stderr,
            signaller,
            exit,
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

struct PidSignaller {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl ProcessSignaller for PidSignaller {
    #[cfg(unix)]
    fn signal(&self, signal: Signal) -> io::Result<()> {
        // The pid may already be reaped and reused.
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pid = self
            .pid
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process has no pid"))?;
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Terminating,
    Terminated,
}

/// How the process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    /// Cancellation could not be confirmed; the OS process may still live.
    TerminationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationTimings {
    /// Wait after SIGTERM before sending SIGKILL.
    pub terminate_grace: Duration,
    /// Wait after SIGKILL before giving up on the process.
    pub kill_grace: Duration,
    /// Capacity of each output channel, in chunks.
    pub stream_buffer: usize,
}

impl Default for EscalationTimings {
    fn default() -> Self {
        Self {
            terminate_grace: Duration::from_millis(500),
            kill_grace: Duration::from_millis(1000),
            stream_buffer: 64,
        }
    }
}

/// Receiving ends handed to the single output consumer.
pub struct ProcessChannels {
    pub stdout: Option<mpsc::Receiver<Bytes>>,
    pub stderr: Option<mpsc::Receiver<Bytes>>,
    pub exit: watch::Receiver<Option<ProcessExit>>,
}

struct ActiveProcess {
    signaller: Arc<dyn ProcessSignaller>,
    exit_tx: Arc<watch::Sender<Option<ProcessExit>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    readers: Vec<JoinHandle<()>>,
    waiter: JoinHandle<()>,
}

struct Inner {
    state: SupervisorState,
    active: Option<ActiveProcess>,
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    timings: EscalationTimings,
    inner: Arc<Mutex<Inner>>,
    #[cfg(test)]
    cleanup_calls: std::sync::atomic::AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, timings: EscalationTimings) -> Self {
        Self {
            launcher,
            timings,
            inner: Arc::new(Mutex::new(Inner {
                state: SupervisorState::Idle,
                active: None,
            })),
            #[cfg(test)]
            cleanup_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.lock().state
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Spawns the process and wires its pipes. A previous process must be
    /// cleaned up first.
    pub fn start(&self, spec: &CommandSpec) -> Result<ProcessChannels, EngineError> {
        let mut inner = self.inner.lock();
        if inner.active.is_some()
            || matches!(
                inner.state,
                SupervisorState::Starting | SupervisorState::Running | SupervisorState::Terminating
            )
        {
            error!("Refusing to start {} while another process is active", spec.program.display());
            return Err(EngineError::ProcessAlreadyActive);
        }

        inner.state = SupervisorState::Starting;
        debug!("Launching {} {:?}", spec.program.display(), spec.args);

        let spawned = match self.launcher.launch(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                inner.state = SupervisorState::Idle;
                error!("Failed to launch {}: {}", spec.program.display(), e);
                return Err(EngineError::LaunchFailed(format!(
                    "{}: {}",
                    spec.program.display(),
                    e
                )));
            }
        };

        let buffer = self.timings.stream_buffer.max(1);
        let mut readers = Vec::with_capacity(2);
        let stdout = spawned.stdout.map(|reader| {
            let (tx, rx) = mpsc::channel(buffer);
            readers.push(tokio::spawn(forward_stream(reader, tx, "stdout")));
            rx
        });
        let stderr = spawned.stderr.map(|reader| {
            let (tx, rx) = mpsc::channel(buffer);
            readers.push(tokio::spawn(forward_stream(reader, tx, "stderr")));
            rx
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let waiter = tokio::spawn(wait_for_exit(spawned.exit, exit_tx.clone(), self.inner.clone()));

        inner.state = SupervisorState::Running;
        inner.active = Some(ActiveProcess {
            signaller: spawned.signaller,
            exit_tx,
            exit_rx: exit_rx.clone(),
            readers,
            waiter,
        });
        info!("Started {}", spec.program.display());

        Ok(ProcessChannels {
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Graceful signal, forceful signal, then give up. Always returns
    /// within `terminate_grace + kill_grace`.
    pub async fn cancel(&self) -> Result<CancelOutcome, EngineError> {
        let (signaller, mut exit_rx, exit_tx) = {
            let mut inner = self.inner.lock();
            if inner.state != SupervisorState::Running {
                return Err(EngineError::NotRunning);
            }
            let Some(active) = inner.active.as_ref() else {
                return Err(EngineError::NotRunning);
            };
            let handles = (
                active.signaller.clone(),
                active.exit_rx.clone(),
                active.exit_tx.clone(),
            );
            inner.state = SupervisorState::Terminating;
            handles
        };

        info!("Sending graceful termination signal");
        if let Err(e) = signaller.signal(Signal::Terminate) {
            warn!("Failed to send SIGTERM: {}", e);
        }
        if wait_for_exit_within(&mut exit_rx, self.timings.terminate_grace).await {
            info!("Process exited after graceful signal");
            return Ok(CancelOutcome::Graceful);
        }

        warn!(
            "Process still running after {}, sending forceful signal",
            humantime::format_duration(self.timings.terminate_grace)
        );
        if let Err(e) = signaller.signal(Signal::Kill) {
            warn!("Failed to send SIGKILL: {}", e);
        }
        if wait_for_exit_within(&mut exit_rx, self.timings.kill_grace).await {
            info!("Process exited after forceful signal");
            return Ok(CancelOutcome::Forced);
        }

        let waited = self.timings.terminate_grace + self.timings.kill_grace;
        error!(
            "Process did not exit within {}, abandoning it",
            humantime::format_duration(waited)
        );
        self.inner.lock().state = SupervisorState::Terminated;
        exit_tx.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ProcessExit::TerminationFailed);
                true
            } else {
                false
            }
        });
        Err(EngineError::ProcessTerminationFailed(format!(
            "rsync did not exit within {} of being signalled",
            humantime::format_duration(waited)
        )))
    }

    /// Detaches the stream forwarders, then releases the process handle.
    /// Safe to call repeatedly or with nothing running.
    pub fn cleanup(&self) {
        #[cfg(test)]
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        self.release();
    }

    /// Explicit `cleanup()` calls so far, no-op ones included.
    #[cfg(test)]
    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    fn release(&self) {
        let active = {
            let mut inner = self.inner.lock();
            let active = inner.active.take();
            if active.is_some() {
                inner.state = SupervisorState::Idle;
            }
            active
        };

        let Some(active) = active else {
            debug!("Cleanup requested with no active process");
            return;
        };

        // Forwarders own the pipe read ends, so aborting them both stops
        // delivery and closes the pipes.
        for reader in &active.readers {
            reader.abort();
        }
        active.waiter.abort();
        drop(active);
        debug!("Released process handle");
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.release();
    }
}

async fn forward_stream(mut reader: BoxedReader, tx: mpsc::Sender<Bytes>, name: &'static str) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        buf.reserve(8 * 1024);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(buf.split().freeze()).await.is_err() {
                    debug!("{} consumer went away", name);
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading rsync {}: {}", name, e);
                break;
            }
        }
    }
}

async fn wait_for_exit(
    exit: BoxFuture<'static, io::Result<i32>>,
    exit_tx: Arc<watch::Sender<Option<ProcessExit>>>,
    inner: Arc<Mutex<Inner>>,
) {
    let code = match exit.await {
        Ok(code) => code,
        Err(e) => {
            error!("Failed to wait for rsync: {}", e);
            -1
        }
    };
    info!("rsync exited with code {}", code);

    {
        let mut inner = inner.lock();
        if matches!(inner.state, SupervisorState::Running | SupervisorState::Terminating) {
            inner.state = SupervisorState::Terminated;
        }
    }
    exit_tx.send_if_modified(|exit| {
        if exit.is_none() {
            *exit = Some(ProcessExit::Exited(code));
            true
        } else {
            false
        }
    });
}

async fn wait_for_exit_within(rx: &mut watch::Receiver<Option<ProcessExit>>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, rx.wait_for(|exit| exit.is_some())).await,
        Ok(Ok(_))
    )
}
