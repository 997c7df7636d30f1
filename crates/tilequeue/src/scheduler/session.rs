use super::{PendingRequest, QueueOrder};
use crate::SequenceId;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// State kept for one client.
pub(crate) struct Session<T> {
    /// One collection per request type, indexed by priority. New arrivals go
    /// to the front.
    pending: Vec<VecDeque<PendingRequest<T>>>,
    in_flight: HashSet<SequenceId>,
    last_seen: Instant,
}

impl<T> Session<T> {
    pub(crate) fn new(types: usize, now: Instant) -> Self {
        Self {
            pending: (0..types).map(|_| VecDeque::new()).collect(),
            in_flight: HashSet::new(),
            last_seen: now,
        }
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub(crate) const fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn queued(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    /// No queued and no in-flight work. Only idle sessions may be evicted.
    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn push(&mut self, request: PendingRequest<T>) {
        self.pending[request.kind].push_front(request);
    }

    /// Pops from the first non-empty type, scanning highest priority first.
    fn pop_next(&mut self, order: QueueOrder) -> Option<PendingRequest<T>> {
        let queue = self.pending.iter_mut().find(|q| !q.is_empty())?;
        match order {
            QueueOrder::Lifo => queue.pop_front(),
            QueueOrder::Fifo => queue.pop_back(),
        }
    }

    pub(crate) fn fill(&mut self, limit: usize, order: QueueOrder) -> Vec<PendingRequest<T>> {
        let mut admitted = Vec::new();
        while self.in_flight.len() < limit {
            let Some(request) = self.pop_next(order) else {
                break;
            };
            self.in_flight.insert(request.id);
            admitted.push(request);
        }
        admitted
    }

    /// Frees the slot held by `id`. `false` if `id` was not in flight.
    pub(crate) fn release(&mut self, id: SequenceId) -> bool {
        self.in_flight.remove(&id)
    }

    /// Removes a request that never got a slot.
    pub(crate) fn remove_pending(&mut self, id: SequenceId) -> Option<PendingRequest<T>> {
        self.pending.iter_mut().find_map(|queue| {
            let pos = queue.iter().position(|r| r.id == id)?;
            queue.remove(pos)
        })
    }
}
