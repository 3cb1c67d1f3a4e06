//! Scripted stand-in for rsync used by the engine tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::supervisor::{
    BoxedReader, CommandSpec, ProcessLauncher, ProcessSignaller, Signal, SpawnedProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeExit {
    /// Exits with the code once all output is written.
    Code(i32),
    /// Exits with 143 on SIGTERM.
    OnTerminate,
    /// Ignores SIGTERM, exits with 137 on SIGKILL.
    OnKill,
    /// Ignores every signal.
    Never,
}

#[derive(Debug, Clone)]
pub struct FakeScript {
    stdout: Vec<Vec<u8>>,
    stderr: Vec<Vec<u8>>,
    on_terminate: Vec<u8>,
    exit: FakeExit,
}

impl FakeScript {
    pub fn new() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            on_terminate: Vec::new(),
            exit: FakeExit::Code(0),
        }
    }

    pub fn stdout(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.stdout.push(chunk.as_ref().to_vec());
        self
    }

    pub fn stderr(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.stderr.push(chunk.as_ref().to_vec());
        self
    }

    /// Written to stderr when SIGTERM arrives, as rsync reports it.
    pub fn on_terminate_stderr(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.on_terminate = chunk.as_ref().to_vec();
        self
    }

    pub fn exit(mut self, exit: FakeExit) -> Self {
        self.exit = exit;
        self
    }
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    scripts: Arc<Mutex<VecDeque<FakeScript>>>,
    launches: Arc<Mutex<Vec<CommandSpec>>>,
    signals: Arc<Mutex<Vec<Signal>>>,
    released: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: FakeScript) {
        self.scripts.lock().push_back(script);
    }

    pub fn launches(&self) -> Vec<CommandSpec> {
        self.launches.lock().clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    /// Number of process handles dropped by the supervisor.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &CommandSpec) -> io::Result<SpawnedProcess> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file or directory"))?;
        self.launches.lock().push(spec.clone());

        let (exit_tx, mut exit_rx) = watch::channel(None::<i32>);
        let exit_tx = Arc::new(exit_tx);

        let (mut stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
        let (mut stderr_w, stderr_r) = tokio::io::duplex(64 * 1024);

        let (terminated_tx, mut terminated_rx) = watch::channel(false);
        let writer_exit = exit_tx.clone();
        let mut writer_rx = exit_rx.clone();
        let FakeScript {
            stdout,
            stderr,
            on_terminate,
            exit,
        } = script;
        tokio::spawn(async move {
            for chunk in stdout {
                if stdout_w.write_all(&chunk).await.is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            for chunk in stderr {
                if stderr_w.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            match exit {
                FakeExit::Code(code) => {
                    drop(stdout_w);
                    drop(stderr_w);
                    writer_exit.send_replace(Some(code));
                }
                _ => {
                    if !on_terminate.is_empty() {
                        tokio::select! {
                            changed = terminated_rx.changed() => {
                                if changed.is_ok() {
                                    let _ = stderr_w.write_all(&on_terminate).await;
                                }
                            }
                            _ = writer_rx.changed() => {}
                        }
                    }
                    // Pipes stay open until a signal ends the process.
                    let _ = writer_rx.wait_for(|code| code.is_some()).await;
                }
            }
        });

        let signaller = Arc::new(FakeSignaller {
            exit,
            exit_tx,
            terminated: terminated_tx,
            signals: self.signals.clone(),
            released: self.released.clone(),
        });

        let exit_future = Box::pin(async move {
            match exit_rx.wait_for(|code| code.is_some()).await {
                Ok(code) => Ok((*code).unwrap_or(-1)),
                Err(_) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake process vanished")),
            }
        });

        Ok(SpawnedProcess {
            stdout: Some(Box::pin(stdout_r) as BoxedReader),
            stderr: Some(Box::pin(stderr_r) as BoxedReader),
            signaller,
            exit: exit_future,
        })
    }
}

struct FakeSignaller {
    exit: FakeExit,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
    terminated: watch::Sender<bool>,
    signals: Arc<Mutex<Vec<Signal>>>,
    released: Arc<AtomicUsize>,
}

impl ProcessSignaller for FakeSignaller {
    fn signal(&self, signal: Signal) -> io::Result<()> {
        self.signals.lock().push(signal);
        if signal == Signal::Terminate {
            self.terminated.send_replace(true);
        }
        let code = match (self.exit, signal) {
            (FakeExit::OnTerminate, Signal::Terminate) => Some(143),
            (FakeExit::OnTerminate | FakeExit::OnKill, Signal::Kill) => Some(137),
            _ => None,
        };
        if let Some(code) = code {
            self.exit_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(code);
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }
}

impl Drop for FakeSignaller {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
