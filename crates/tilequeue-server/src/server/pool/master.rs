use crate::server::config::PoolConfig;
use crate::server::pool::launcher::{EventSender, Launcher, WorkerEvent, WorkerHandle};
use crate::server::signal::PoolSignal;
use crate::server::telemetry;
use core::pin::Pin;
use core::time::Duration;
use std::collections::HashMap;
use tilequeue::pool::{ControlMessage, WorkerReport};
use tilequeue::{Error, ExitAction, PoolState, WorkerId, WorkerState};
use tokio::sync::mpsc;
use tokio::time::{Sleep, sleep};

/// Delay before retrying a worker whose launch failed.
const RELAUNCH_BACKOFF: Duration = Duration::from_secs(1);

/// Supervises the worker pool: keeps it at size, recycles it on request and
/// takes it down on shutdown.
pub struct Master<L: Launcher> {
    config: PoolConfig,
    state: PoolState,
    launcher: L,
    handles: HashMap<WorkerId, L::Handle>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
    stops_tx: mpsc::UnboundedSender<WorkerId>,
    stops_rx: mpsc::UnboundedReceiver<WorkerId>,
}

impl<L: Launcher> Master<L> {
    pub fn new(config: PoolConfig, launcher: L) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stops_tx, stops_rx) = mpsc::unbounded_channel();
        Self {
            state: PoolState::new(config.num_workers),
            config,
            launcher,
            handles: HashMap::new(),
            events_tx,
            events_rx,
            stops_tx,
            stops_rx,
        }
    }

    /// Runs until the pool has shut down.
    ///
    /// A closed `signals` channel counts as a shutdown request.
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownDeadlineExceeded`] when workers were still alive at
    /// the hard deadline and had to be killed.
    pub async fn run(mut self, mut signals: mpsc::UnboundedReceiver<PoolSignal>) -> anyhow::Result<()> {
        tracing::info!(
            "Setting up {} workers on {}",
            self.state.size(),
            self.config.backend_addr
        );
        for id in self.state.fill() {
            self.launch(id);
        }

        let mut deadline: Option<Pin<Box<Sleep>>> = None;
        loop {
            if self.state.is_shutting_down() && self.state.is_empty() {
                tracing::info!("All workers exited");
                return Ok(());
            }

            tokio::select! {
                Some((id, event)) = self.events_rx.recv() => self.on_event(id, event),
                signal = signals.recv(), if deadline.is_none() => match signal {
                    Some(PoolSignal::RollingRestart) => self.rolling_restart(),
                    Some(PoolSignal::Shutdown) | None => {
                        self.shutdown();
                        deadline = Some(Box::pin(sleep(self.config.stop_interval())));
                    }
                },
                Some(id) = self.stops_rx.recv() => self.stop(id),
                () = async {
                    match deadline.as_mut() {
                        Some(deadline) => deadline.await,
                        None => core::future::pending().await,
                    }
                } => return Err(self.force_exit().into()),
            }
        }
    }

    fn launch(&mut self, id: WorkerId) {
        match self.launcher.launch(id, self.events_tx.clone()) {
            Ok(handle) => {
                let pid = handle.pid();
                self.state.attach(id, pid);
                tracing::debug!("Launched worker {id} (pid {pid:?})");
                self.handles.insert(id, handle);
            }
            Err(e) => {
                tracing::error!("Failed to launch worker {id}: {e:#}");
                // Retried through the ordinary exit path.
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    sleep(RELAUNCH_BACKOFF).await;
                    let _ = events.send((
                        id,
                        WorkerEvent::Exited {
                            status: "launch failed".into(),
                            success: false,
                        },
                    ));
                });
            }
        }
    }

    fn on_event(&mut self, id: WorkerId, event: WorkerEvent) {
        match event {
            WorkerEvent::Report(report) => {
                if !self.state.on_report(id, &report) {
                    tracing::debug!("Ignoring {report:?} from worker {id}");
                    return;
                }
                match report {
                    WorkerReport::Serving { pid } => {
                        tracing::info!("Worker {id} (pid {pid}) is serving");
                    }
                    WorkerReport::Draining { reason, served } => {
                        tracing::info!("Worker {id} draining ({reason:?}) after {served} requests");
                    }
                }
            }
            WorkerEvent::Exited { status, success } => self.on_exit(id, status, success),
        }
    }

    fn on_exit(&mut self, id: WorkerId, status: String, success: bool) {
        self.handles.remove(&id);
        let was_draining = self
            .state
            .get(id)
            .is_some_and(|slot| slot.state == WorkerState::Draining);
        let Some((slot, action)) = self.state.on_exit(id) else {
            tracing::debug!("Exit of unknown worker {id}");
            return;
        };

        match action {
            ExitAction::Respawn(next) => {
                if was_draining && success {
                    tracing::info!(
                        "Worker {id} exited after {} requests, starting worker {next}",
                        slot.served
                    );
                } else {
                    let crash = Error::WorkerCrash {
                        worker: id.to_raw(),
                        status,
                    };
                    tracing::warn!("{crash}, starting worker {next}");
                }
                telemetry::increment_worker_respawns();
                self.launch(next);
            }
            ExitAction::Drained { remaining } => {
                tracing::info!("Worker {id} exited ({status}), {remaining} remaining");
            }
        }
    }

    fn shutdown(&mut self) {
        let ids = self.state.begin_shutdown();
        tracing::info!(
            "Shutting down {} workers, deadline {:?}",
            ids.len(),
            self.config.stop_interval()
        );
        for id in ids {
            self.send_stop(id);
        }
    }

    /// Schedules one stop per worker, `drain_timeout + safety_margin` apart,
    /// so at most one worker drains at a time. A request that arrives while
    /// a restart is still cycling joins that restart.
    fn rolling_restart(&mut self) {
        if self.state.is_shutting_down() {
            return;
        }
        if self.state.is_rolling() {
            tracing::info!("Rolling restart already in progress, ignoring SIGHUP");
            return;
        }
        let plan = self.state.rolling_plan(self.config.stop_interval());
        tracing::info!(
            "Rolling restart of {} workers, one every {:?}",
            plan.len(),
            self.config.stop_interval()
        );
        for (delay, id) in plan {
            let stops = self.stops_tx.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = stops.send(id);
            });
        }
    }

    fn stop(&mut self, id: WorkerId) {
        if self.state.is_shutting_down() {
            return;
        }
        if self.state.request_stop(id) {
            tracing::info!("Stopping worker {id}");
            self.send_stop(id);
        } else {
            tracing::debug!("Worker {id} already gone or draining");
        }
    }

    fn send_stop(&self, id: WorkerId) {
        let Some(handle) = self.handles.get(&id) else {
            return;
        };
        if !handle.send(ControlMessage::Stop) {
            tracing::warn!("Control channel to worker {id} is closed");
        }
    }

    fn force_exit(&mut self) -> Error {
        let deadline_ms = u64::try_from(self.config.stop_interval().as_millis()).unwrap_or(u64::MAX);
        let err = Error::ShutdownDeadlineExceeded { deadline_ms };
        tracing::error!("{err}, killing {} workers", self.handles.len());
        for (_, mut handle) in self.handles.drain() {
            handle.kill();
        }
        err
    }
}
