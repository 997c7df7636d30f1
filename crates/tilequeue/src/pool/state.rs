use super::control::WorkerReport;
use core::fmt;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};

/// Master-assigned identifier of one worker slot.
///
/// Every process the master starts gets a fresh id, so a respawned worker
/// never shares an id with the one it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Launched, listener not confirmed yet.
    Starting,
    /// Accepting connections.
    Serving,
    /// Listener closed, finishing outstanding responses.
    Draining,
    /// Process exited.
    Terminated,
}

impl WorkerState {
    /// Whether `self → next` is a legal transition.
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Serving)
                | (Self::Starting | Self::Serving, Self::Draining)
                | (Self::Starting | Self::Serving | Self::Draining, Self::Terminated)
        )
    }
}

/// One worker process as seen by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    /// Requests served, as last reported by the worker.
    pub served: u64,
    pub state: WorkerState,
}

impl WorkerSlot {
    const fn new(id: WorkerId) -> Self {
        Self {
            id,
            pid: None,
            served: 0,
            state: WorkerState::Starting,
        }
    }

    fn transition(&mut self, next: WorkerState) -> bool {
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// What the master must do after a worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Launch a replacement under the given id.
    Respawn(WorkerId),
    /// Part of a shutdown; `remaining` workers are still alive.
    Drained { remaining: usize },
}

/// Bookkeeping for a pool of `size` workers.
#[derive(Debug)]
pub struct PoolState {
    size: usize,
    slots: BTreeMap<WorkerId, WorkerSlot>,
    next_id: u64,
    shutting_down: bool,
    /// Workers a rolling restart still has to cycle.
    rolling: BTreeSet<WorkerId>,
}

impl PoolState {
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            slots: BTreeMap::new(),
            next_id: 0,
            shutting_down: false,
            rolling: BTreeSet::new(),
        }
    }

    /// Configured pool size.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Live slots (any state but `Terminated`).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Whether a rolling restart still has workers that have not exited.
    pub fn is_rolling(&self) -> bool {
        !self.rolling.is_empty()
    }

    /// Number of live slots in `state`.
    pub fn count(&self, state: WorkerState) -> usize {
        self.slots.values().filter(|s| s.state == state).count()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    fn allocate(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, WorkerSlot::new(id));
        id
    }

    /// Allocates slots until the pool is back at its configured size.
    ///
    /// Returns the ids the master must launch. Nothing is allocated once a
    /// shutdown has begun.
    pub fn fill(&mut self) -> Vec<WorkerId> {
        if self.shutting_down {
            return Vec::new();
        }
        let missing = self.size.saturating_sub(self.slots.len());
        (0..missing).map(|_| self.allocate()).collect()
    }

    /// Records the OS process id of a launched worker.
    pub fn attach(&mut self, id: WorkerId, pid: Option<u32>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.pid = pid;
        }
    }

    /// Applies a report from worker `id`. Returns `false` if the report did
    /// not match a live slot or an allowed transition.
    pub fn on_report(&mut self, id: WorkerId, report: &WorkerReport) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        match *report {
            WorkerReport::Serving { pid } => {
                slot.pid = Some(pid);
                slot.transition(WorkerState::Serving)
            }
            WorkerReport::Draining { served, .. } => {
                slot.served = served;
                // The master may already have marked it draining.
                slot.state == WorkerState::Draining || slot.transition(WorkerState::Draining)
            }
        }
    }

    /// Marks worker `id` as draining ahead of sending it a stop command.
    ///
    /// Returns `false` when the worker is gone or already draining, in which
    /// case no command needs to be sent.
    pub fn request_stop(&mut self, id: WorkerId) -> bool {
        self.slots
            .get_mut(&id)
            .is_some_and(|slot| slot.transition(WorkerState::Draining))
    }

    /// Handles the exit of worker `id`.
    ///
    /// Returns the terminated slot and the follow-up action, or `None` if the
    /// id is unknown (for instance a duplicate exit notification).
    pub fn on_exit(&mut self, id: WorkerId) -> Option<(WorkerSlot, ExitAction)> {
        let mut slot = self.slots.remove(&id)?;
        slot.transition(WorkerState::Terminated);
        self.rolling.remove(&id);
        #[cfg(feature = "tracing")]
        tracing::debug!(served = slot.served, "Worker {id} terminated");

        let action = if self.shutting_down {
            ExitAction::Drained {
                remaining: self.slots.len(),
            }
        } else {
            ExitAction::Respawn(self.allocate())
        };
        Some((slot, action))
    }

    /// Starts an immediate shutdown.
    ///
    /// Returns every live worker; each must be sent a stop command. Later
    /// exits no longer trigger respawns.
    pub fn begin_shutdown(&mut self) -> Vec<WorkerId> {
        self.shutting_down = true;
        self.rolling.clear();
        self.slots
            .values_mut()
            .map(|slot| {
                slot.transition(WorkerState::Draining);
                slot.id
            })
            .collect()
    }

    /// Plans a rolling restart: one stop per active worker, `stagger` apart.
    ///
    /// Workers already draining are left alone. The plan is a snapshot; the
    /// master should re-check each worker with [`request_stop`] when its
    /// turn comes, since it may have exited in the meantime.
    ///
    /// While an earlier restart still has workers that have not exited, or
    /// during shutdown, the plan is empty: overlapping plans would drain two
    /// workers at once.
    ///
    /// [`request_stop`]: Self::request_stop
    pub fn rolling_plan(&mut self, stagger: Duration) -> Vec<(Duration, WorkerId)> {
        if self.shutting_down || self.is_rolling() {
            #[cfg(feature = "tracing")]
            tracing::debug!(pending = self.rolling.len(), "Rolling restart already under way");
            return Vec::new();
        }
        let plan: Vec<_> = self
            .slots
            .values()
            .filter(|slot| slot.state != WorkerState::Draining)
            .zip(0u32..)
            .map(|(slot, i)| (stagger * i, slot.id))
            .collect();
        self.rolling = plan.iter().map(|&(_, id)| id).collect();
        plan
    }
}
