//! The task that owns the [`Scheduler`].
//!
//! Connection handlers never touch scheduling state. They send [`Command`]s
//! over an unbounded channel and wait on a oneshot grant. Everything already
//! sitting in the mailbox when the task wakes up is applied as one batch:
//! arrivals are queued first, then each touched client's budget is filled
//! once, so priority and recency hold across requests that arrived together.

use crate::server::dispatch::ticket::{Outcome, Ticket};
use crate::server::telemetry;
use core::time::Duration;
use std::collections::VecDeque;
use tilequeue::{
    Admitted, Completion, Error, Fingerprint, PendingRequest, Scheduler, SequenceId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound on commands applied before the budgets are filled.
const MAX_BATCH: usize = 256;

/// What the scheduler stores for a waiting request.
pub(crate) struct Grant {
    admit: oneshot::Sender<()>,
    arrived: Instant,
}

pub(crate) enum Command {
    Submit {
        fingerprint: Fingerprint,
        request: PendingRequest<Grant>,
    },
    Complete {
        fingerprint: Fingerprint,
        id: SequenceId,
        outcome: Outcome,
    },
    /// In-flight and queued counts for one client.
    #[cfg(test)]
    Inspect {
        fingerprint: Fingerprint,
        reply: oneshot::Sender<(usize, usize)>,
    },
}

/// Cloneable sender side of the dispatcher task.
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatcherHandle {
    /// Registers request `id` of type `kind` and returns its [`Ticket`].
    ///
    /// # Errors
    ///
    /// [`Error::ServiceShutdown`] if the dispatcher task has stopped.
    pub(crate) fn submit(
        &self,
        fingerprint: Fingerprint,
        id: SequenceId,
        kind: usize,
    ) -> Result<Ticket, Error> {
        let (admit, admitted) = oneshot::channel();
        let grant = Grant {
            admit,
            arrived: Instant::now(),
        };
        self.tx
            .send(Command::Submit {
                fingerprint: fingerprint.clone(),
                request: PendingRequest::new(id, kind, grant),
            })
            .map_err(|_| Error::ServiceShutdown)?;
        Ok(Ticket::new(fingerprint, id, self.tx.clone(), admitted))
    }

    #[cfg(test)]
    pub(crate) async fn inspect(&self, fingerprint: &Fingerprint) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Inspect {
            fingerprint: fingerprint.clone(),
            reply,
        });
        rx.await.unwrap_or_default()
    }
}

struct Actor {
    scheduler: Scheduler<Grant>,
    rx: mpsc::UnboundedReceiver<Command>,
}

/// Spawns the dispatcher task. It runs until `stop` is cancelled or every
/// handle and ticket is gone.
pub(crate) fn spawn(
    scheduler: Scheduler<Grant>,
    sweep_interval: Duration,
    stop: CancellationToken,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Actor { scheduler, rx };
    let task = tokio::spawn(actor.run(sweep_interval, stop));
    (DispatcherHandle { tx }, task)
}

impl Actor {
    async fn run(mut self, sweep_interval: Duration, stop: CancellationToken) {
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_batch(cmd);
                }
                _ = sweep.tick() => {
                    let swept = self.scheduler.sweep();
                    if swept > 0 {
                        tracing::debug!(
                            swept,
                            sessions = self.scheduler.session_count(),
                            "Swept idle sessions"
                        );
                    }
                }
            }
        }

        // Dropping the scheduler drops every pending grant; waiting handlers
        // see the closed channel and answer 503.
        tracing::debug!(
            sessions = self.scheduler.session_count(),
            "Dispatcher stopped"
        );
    }

    fn handle_batch(&mut self, first: Command) {
        let mut touched = Vec::new();
        #[cfg(test)]
        let mut inspections = Vec::new();

        let mut next = Some(first);
        let mut applied = 0;
        while let Some(cmd) = next.take() {
            match cmd {
                Command::Submit {
                    fingerprint,
                    request,
                } => {
                    telemetry::increment_requests();
                    telemetry::add_queued(1);
                    if !touched.contains(&fingerprint) {
                        touched.push(fingerprint.clone());
                    }
                    self.scheduler.enqueue(fingerprint, request);
                }
                Command::Complete {
                    fingerprint,
                    id,
                    outcome,
                } => self.complete(&fingerprint, id, outcome),
                #[cfg(test)]
                Command::Inspect { fingerprint, reply } => {
                    inspections.push((fingerprint, reply));
                }
            }

            applied += 1;
            if applied < MAX_BATCH {
                next = self.rx.try_recv().ok();
            }
        }

        for fingerprint in touched {
            let admitted = self.scheduler.fill(&fingerprint);
            self.dispatch(admitted);
        }

        #[cfg(test)]
        for (fingerprint, reply) in inspections {
            let _ = reply.send((
                self.scheduler.in_flight(&fingerprint),
                self.scheduler.queued(&fingerprint),
            ));
        }
    }

    fn complete(&mut self, fingerprint: &Fingerprint, id: SequenceId, outcome: Outcome) {
        match self.scheduler.complete(fingerprint, id) {
            Completion::Released { admitted } => {
                telemetry::add_inflight(-1);
                match outcome {
                    Outcome::Forwarded => tracing::debug!("{id} FINISHED"),
                    Outcome::BackendError => tracing::debug!("{id} FAILED"),
                    Outcome::Disconnected => {
                        telemetry::increment_disconnects();
                        tracing::info!(%fingerprint, "{id} in flight: {}", Error::ClientDisconnected);
                    }
                }
                self.dispatch(admitted);
            }
            Completion::Dequeued { .. } => {
                telemetry::add_queued(-1);
                telemetry::increment_disconnects();
                tracing::info!(%fingerprint, "{id} queued: {}", Error::ClientDisconnected);
            }
            Completion::AlreadyCompleted => {
                tracing::trace!("{id} already completed");
            }
        }
    }

    /// Wakes admitted handlers. A handler that is already gone gives its slot
    /// straight back, which may admit more.
    fn dispatch(&mut self, admitted: Vec<Admitted<Grant>>) {
        let mut ready = VecDeque::from(admitted);
        while let Some(Admitted {
            fingerprint,
            request,
        }) = ready.pop_front()
        {
            let PendingRequest {
                id,
                payload: Grant { admit, arrived },
                ..
            } = request;

            telemetry::add_queued(-1);
            telemetry::add_inflight(1);
            telemetry::record_queue_wait(arrived.elapsed().as_secs_f64() * 1000.0);

            if admit.send(()).is_err() {
                tracing::debug!("{id} admitted after its client left");
                if let Completion::Released { admitted } = self.scheduler.complete(&fingerprint, id)
                {
                    telemetry::add_inflight(-1);
                    ready.extend(admitted);
                }
            }
        }
    }
}
