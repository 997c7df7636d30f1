//! Starting worker processes and relaying what they say.

use crate::server::config::PoolConfig;
use anyhow::Context;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tilequeue::WorkerId;
use tilequeue::pool::{ControlMessage, WorkerReport, decode_line, encode_line};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

/// Something the master learns about one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Report(WorkerReport),
    /// The process is gone. `status` is for logs only.
    Exited { status: String, success: bool },
}

impl WorkerEvent {
    fn exited(status: ExitStatus) -> Self {
        Self::Exited {
            status: status.to_string(),
            success: status.success(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<(WorkerId, WorkerEvent)>;

/// How the master starts a worker.
///
/// A launched worker must eventually deliver exactly one
/// [`WorkerEvent::Exited`] for its id on `events`.
pub trait Launcher: Send + 'static {
    type Handle: WorkerHandle;

    fn launch(&mut self, id: WorkerId, events: EventSender) -> anyhow::Result<Self::Handle>;
}

/// The master's grip on one launched worker.
pub trait WorkerHandle: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Queues `msg` for the worker. Returns `false` once the channel is
    /// closed.
    fn send(&self, msg: ControlMessage) -> bool;

    /// Terminates the worker without waiting for it to drain.
    fn kill(&mut self);
}

/// Launches workers by re-running the current executable with the hidden
/// `worker` subcommand.
pub struct ProcessLauncher {
    program: PathBuf,
    config: PoolConfig,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config: PoolConfig) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    pub fn current_exe(config: PoolConfig) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("cannot locate own executable")?;
        Ok(Self::new(program, config))
    }
}

pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<ControlMessage>,
    kill: Option<oneshot::Sender<()>>,
}

impl Launcher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(&mut self, id: WorkerId, events: EventSender) -> anyhow::Result<ProcessHandle> {
        let mut child = Command::new(&self.program)
            .args(self.config.worker(id).to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let pid = child.id();
        let stdin = child.stdin.take().context("worker stdin was not piped")?;
        let stdout = child.stdout.take().context("worker stdout was not piped")?;

        let (control, commands) = mpsc::unbounded_channel();
        let (kill, killed) = oneshot::channel();
        tokio::spawn(write_control(id, stdin, commands));
        tokio::spawn(monitor(id, child, stdout, killed, events));

        Ok(ProcessHandle {
            pid,
            control,
            kill: Some(kill),
        })
    }
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&self, msg: ControlMessage) -> bool {
        self.control.send(msg).is_ok()
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Writes control messages to the worker's stdin. Closing the channel closes
/// stdin, which the worker reads as "master gone".
async fn write_control(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(msg) = commands.recv().await {
        let line = match encode_line(&msg) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Worker {id}: {e}");
                continue;
            }
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!("Worker {id}: control channel closed: {e}");
            return;
        }
    }
}

/// Relays stdout reports until the worker exits, then reports the exit.
async fn monitor(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    mut killed: oneshot::Receiver<()>,
    events: EventSender,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut reading = true;

    let status = loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line {
                Ok(Some(line)) => match decode_line::<WorkerReport>(&line) {
                    Ok(report) => {
                        let _ = events.send((id, WorkerEvent::Report(report)));
                    }
                    Err(e) => tracing::warn!("Worker {id}: {e}"),
                },
                Ok(None) => reading = false,
                Err(e) => {
                    tracing::warn!("Worker {id}: reading reports failed: {e}");
                    reading = false;
                }
            },
            status = child.wait() => break status,
            res = &mut killed => {
                if res.is_ok() {
                    tracing::warn!("Killing worker {id}");
                } else {
                    tracing::warn!("Worker {id} abandoned by the master, killing it");
                }
                if let Err(e) = child.start_kill() {
                    tracing::error!("Worker {id}: kill failed: {e}");
                }
                break child.wait().await;
            }
        }
    };

    let event = match status {
        Ok(status) => WorkerEvent::exited(status),
        Err(e) => WorkerEvent::Exited {
            status: format!("wait failed: {e}"),
            success: false,
        },
    };
    let _ = events.send((id, event));
}
