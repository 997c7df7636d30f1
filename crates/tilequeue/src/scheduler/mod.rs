//! Per-client admission scheduling.
//!
//! A [`Scheduler`] holds one session per client [`Fingerprint`]. Each session
//! owns a pending collection per request type and a set of in-flight request
//! ids. Requests are admitted while the client's in-flight count is below
//! `requests_per_client`; the highest-priority non-empty type is always
//! drained first.
//!
//! The scheduler is a plain synchronous state machine. It is meant to be
//! owned by exactly one task, which is what makes the per-client mutations
//! safe without a lock.
//!
//! ## Completion
//!
//! Success, backend error and client disconnect all funnel into
//! [`Scheduler::complete`]. The first call for a request either frees its
//! slot and refills the budget, or removes it from its pending collection if
//! it was never admitted. Every later call is a no-op that returns
//! [`Completion::AlreadyCompleted`].

mod session;
mod store;
#[cfg(test)]
mod tests;

use crate::{Error, Fingerprint, MonotonicClock, Result, SequenceId, TimeSource, TypePriority};
use core::num::NonZeroUsize;
use core::str::FromStr;
use core::time::Duration;
use session::Session;
use store::SessionStore;

/// Order in which requests of the same type leave their pending collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueOrder {
    /// Most recently arrived first. Stale map-pan tiles wait behind the tiles
    /// the user is looking at now.
    #[default]
    Lifo,
    /// Arrival order.
    Fifo,
}

impl FromStr for QueueOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lifo" => Ok(Self::Lifo),
            "fifo" => Ok(Self::Fifo),
            other => Err(Error::InvalidConfig {
                reason: format!("unknown queue order `{other}` (expected `lifo` or `fifo`)"),
            }),
        }
    }
}

/// Tuning for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission budget per client.
    pub requests_per_client: NonZeroUsize,
    /// Pop order within one request type.
    pub order: QueueOrder,
    /// Soft limit on the number of sessions kept in memory.
    pub session_capacity: usize,
    /// How long an idle session survives without activity.
    pub session_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            requests_per_client: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            order: QueueOrder::Lifo,
            session_capacity: 10_000,
            session_ttl: Duration::from_secs(600),
        }
    }
}

/// One unit of work waiting for, or holding, an admission slot.
///
/// `payload` is opaque to the scheduler. The dispatcher stores whatever it
/// needs to wake the request up once it is admitted.
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub id: SequenceId,
    /// Index into the [`TypePriority`] list.
    pub kind: usize,
    pub payload: T,
}

impl<T> PendingRequest<T> {
    pub const fn new(id: SequenceId, kind: usize, payload: T) -> Self {
        Self { id, kind, payload }
    }
}

/// A request that just took an admission slot and must now be forwarded.
#[derive(Debug)]
pub struct Admitted<T> {
    pub fingerprint: Fingerprint,
    pub request: PendingRequest<T>,
}

/// Outcome of [`Scheduler::complete`].
#[derive(Debug)]
pub enum Completion<T> {
    /// The request was in flight. Its slot was freed and `admitted` lists the
    /// requests that took the freed capacity.
    Released { admitted: Vec<Admitted<T>> },
    /// The request was still pending and has been dropped from its queue.
    /// No slot was ever consumed.
    Dequeued { request: PendingRequest<T> },
    /// The request had already been completed, or was never known.
    AlreadyCompleted,
}

impl<T> Completion<T> {
    /// Returns `true` unless this was a duplicate completion.
    pub const fn is_first(&self) -> bool {
        !matches!(self, Self::AlreadyCompleted)
    }
}

/// Per-client admission control with per-type priority.
pub struct Scheduler<T, C = MonotonicClock> {
    config: SchedulerConfig,
    types: TypePriority,
    sessions: SessionStore<T>,
    clock: C,
}

impl<T> Scheduler<T> {
    /// Creates a scheduler reading time from the system's monotonic clock.
    pub fn new(config: SchedulerConfig, types: TypePriority) -> Self {
        Self::with_clock(config, types, MonotonicClock)
    }
}

impl<T, C: TimeSource> Scheduler<T, C> {
    /// Creates a scheduler with a custom [`TimeSource`].
    pub fn with_clock(config: SchedulerConfig, types: TypePriority, clock: C) -> Self {
        let sessions = SessionStore::new(config.session_capacity, config.session_ttl);
        Self {
            config,
            types,
            sessions,
            clock,
        }
    }

    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub const fn types(&self) -> &TypePriority {
        &self.types
    }

    /// Queues `request` for `fingerprint` and fills the client's budget.
    ///
    /// Returns every request admitted as a consequence, in dispatch order.
    pub fn submit(
        &mut self,
        fingerprint: Fingerprint,
        request: PendingRequest<T>,
    ) -> Vec<Admitted<T>> {
        self.enqueue(fingerprint.clone(), request);
        self.fill(&fingerprint)
    }

    /// Queues `request` at the head of its type's pending collection without
    /// admitting anything.
    ///
    /// Used when several requests arrive in the same tick: queue them all,
    /// then [`fill`](Self::fill) once, so priority and recency apply across
    /// the whole batch.
    pub fn enqueue(&mut self, fingerprint: Fingerprint, mut request: PendingRequest<T>) {
        let now = self.clock.now();
        if request.kind >= self.types.len() {
            request.kind = self.types.fallback();
        }
        let types = self.types.len();
        let session = self.sessions.get_or_insert(fingerprint, now, types);
        session.touch(now);
        session.push(request);
    }

    /// Admits pending requests for `fingerprint` while its budget allows.
    pub fn fill(&mut self, fingerprint: &Fingerprint) -> Vec<Admitted<T>> {
        let limit = self.config.requests_per_client.get();
        let order = self.config.order;
        let Some(session) = self.sessions.get_mut(fingerprint) else {
            return Vec::new();
        };
        session
            .fill(limit, order)
            .into_iter()
            .map(|request| Admitted {
                fingerprint: fingerprint.clone(),
                request,
            })
            .collect()
    }

    /// Completes request `id` of `fingerprint`.
    ///
    /// This is the one idempotent completion path for success, backend
    /// errors and client disconnects alike. See [`Completion`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all, fields(%fingerprint, %id)))]
    pub fn complete(&mut self, fingerprint: &Fingerprint, id: SequenceId) -> Completion<T> {
        let now = self.clock.now();
        let Some(session) = self.sessions.get_mut(fingerprint) else {
            return Completion::AlreadyCompleted;
        };
        session.touch(now);

        if session.release(id) {
            Completion::Released {
                admitted: self.fill(fingerprint),
            }
        } else if let Some(request) = session.remove_pending(id) {
            #[cfg(feature = "tracing")]
            tracing::debug!("{id} still in the queue, removed");
            Completion::Dequeued { request }
        } else {
            Completion::AlreadyCompleted
        }
    }

    /// Drops idle sessions whose TTL has passed. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        self.sessions.sweep(now)
    }

    /// Requests of `fingerprint` currently holding a slot.
    pub fn in_flight(&self, fingerprint: &Fingerprint) -> usize {
        self.sessions.get(fingerprint).map_or(0, Session::in_flight)
    }

    /// Requests of `fingerprint` waiting for a slot.
    pub fn queued(&self, fingerprint: &Fingerprint) -> usize {
        self.sessions.get(fingerprint).map_or(0, Session::queued)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, fingerprint: &Fingerprint) -> bool {
        self.sessions.get(fingerprint).is_some()
    }
}
