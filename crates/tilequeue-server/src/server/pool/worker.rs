//! The worker role: one process serving the rendering backend on the shared
//! backend port.
//!
//! Lifecycle:
//!
//! 1. bind the backend address with `SO_REUSEPORT`, report `serving`,
//! 2. serve until told to stop, the request limit is hit, or stdin closes,
//! 3. close the listener, report `draining`, let open connections finish for
//!    up to the drain timeout, exit.

use crate::server::config::WorkerConfig;
use crate::server::pool::render::Renderer;
use anyhow::Context;
use core::convert::Infallible;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tilequeue::Error;
use tilequeue::pool::{ControlMessage, DrainReason, WorkerReport, decode_line, encode_line};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const LISTEN_BACKLOG: u32 = 1024;

pub struct Worker {
    config: WorkerConfig,
    renderer: Arc<dyn Renderer>,
}

impl Worker {
    pub fn new(config: WorkerConfig, renderer: impl Renderer) -> Self {
        Self {
            config,
            renderer: Arc::new(renderer),
        }
    }

    /// Binds the backend address so that every worker can hold it at once.
    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        bind_shared(self.config.backend_addr)
            .with_context(|| format!("failed to bind {}", self.config.backend_addr))
    }

    /// Serves `listener` until a drain is triggered, then drains.
    ///
    /// `control` carries master commands, `reports` receives this worker's
    /// reports. Cancelling `stop` drains like a `stop` command.
    pub async fn serve<R, W>(
        self,
        listener: TcpListener,
        control: R,
        mut reports: W,
        stop: CancellationToken,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let Self { config, renderer } = self;
        let id = config.id;
        let max_requests = config.max_requests;

        let pid = std::process::id();
        report(&mut reports, &WorkerReport::Serving { pid }).await?;
        tracing::info!("Worker {id} (pid {pid}) serving on {}", listener.local_addr()?);

        let (drain_tx, mut drain_rx) = mpsc::channel(4);
        tokio::spawn(read_control(control, drain_tx.clone()));

        let served = Arc::new(AtomicU64::new(0));
        let http = http1::Builder::new();
        let graceful = GracefulShutdown::new();

        let reason = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::warn!("Worker {id}: accept failed: {e}");
                            continue;
                        }
                    };

                    let renderer = Arc::clone(&renderer);
                    let served = Arc::clone(&served);
                    let drain = drain_tx.clone();
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let (parts, _body) = req.into_parts();
                        let resp = renderer.render(id, &parts);
                        let count = served.fetch_add(1, Ordering::Relaxed) + 1;
                        if max_requests.is_some_and(|max| count == max.get()) {
                            let _ = drain.try_send(DrainReason::MaxRequests);
                        }
                        async move { Ok::<_, Infallible>(resp) }
                    });

                    let conn = graceful.watch(http.serve_connection(TokioIo::new(stream), service));
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!("Worker {id}: connection ended: {e}");
                        }
                    });
                }
                reason = drain_rx.recv() => break reason.unwrap_or(DrainReason::Orphaned),
                () = stop.cancelled() => break DrainReason::Stop,
            }
        };

        drop(listener);
        let served = served.load(Ordering::Relaxed);
        tracing::info!("Worker {id} draining ({reason:?}) after {served} requests");
        if let Err(e) = report(&mut reports, &WorkerReport::Draining { reason, served }).await {
            tracing::warn!("Worker {id}: could not report draining: {e:#}");
        }

        match tokio::time::timeout(config.drain_timeout, graceful.shutdown()).await {
            Ok(()) => tracing::info!("Worker {id} drained"),
            Err(_) => {
                let deadline_ms = u64::try_from(config.drain_timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    "Worker {id}: {}, dropping open connections",
                    Error::ShutdownDeadlineExceeded { deadline_ms }
                );
            }
        }
        Ok(())
    }
}

fn bind_shared(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn report<W: AsyncWrite + Unpin>(out: &mut W, report: &WorkerReport) -> anyhow::Result<()> {
    let line = encode_line(report)?;
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Turns the master's commands into a drain reason. End of input means the
/// master is gone.
async fn read_control<R: AsyncRead + Unpin>(control: R, drain: mpsc::Sender<DrainReason>) {
    let mut lines = BufReader::new(control).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match decode_line::<ControlMessage>(&line) {
                Ok(ControlMessage::Stop) => break DrainReason::Stop,
                Err(e) => tracing::warn!("Ignoring control line: {e}"),
            },
            Ok(None) => break DrainReason::Orphaned,
            Err(e) => {
                tracing::warn!("Control channel failed: {e}");
                break DrainReason::Orphaned;
            }
        }
    };
    let _ = drain.send(reason).await;
}

/// Entry point of the `worker` subcommand.
pub async fn run(config: WorkerConfig, renderer: impl Renderer) -> anyhow::Result<()> {
    let stop = CancellationToken::new();
    spawn_signal_relay(stop.clone())?;

    let worker = Worker::new(config, renderer);
    let listener = worker.bind()?;
    worker
        .serve(listener, tokio::io::stdin(), tokio::io::stdout(), stop)
        .await
}

/// `SIGTERM` drains. `SIGINT` and `SIGHUP` are ignored: a terminal sends them
/// to the whole process group, and the master decides what the pool does.
fn spawn_signal_relay(stop: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = terminate.recv() => {
                        stop.cancel();
                        return;
                    }
                    Some(()) = interrupt.recv() => tracing::debug!("Ignoring SIGINT, waiting for the master"),
                    Some(()) = hangup.recv() => tracing::debug!("Ignoring SIGHUP, waiting for the master"),
                    else => return,
                }
            }
        });
    }
    #[cfg(not(unix))]
    let _ = stop;
    Ok(())
}
