//! Bounded storage for client sessions.
//!
//! Eviction rule: only idle sessions (nothing queued, nothing in flight) are
//! ever removed. Idle sessions older than the TTL go on [`sweep`], and when a
//! new client shows up at capacity the least recently seen idle session makes
//! room. If every session is busy the store grows past its capacity.
//!
//! [`sweep`]: SessionStore::sweep

use super::session::Session;
use crate::Fingerprint;
use core::time::Duration;
use std::collections::HashMap;
use std::time::Instant;

pub(crate) struct SessionStore<T> {
    sessions: HashMap<Fingerprint, Session<T>>,
    capacity: usize,
    ttl: Duration,
}

impl<T> SessionStore<T> {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            capacity,
            ttl,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn get(&self, fingerprint: &Fingerprint) -> Option<&Session<T>> {
        self.sessions.get(fingerprint)
    }

    pub(crate) fn get_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut Session<T>> {
        self.sessions.get_mut(fingerprint)
    }

    pub(crate) fn get_or_insert(
        &mut self,
        fingerprint: Fingerprint,
        now: Instant,
        types: usize,
    ) -> &mut Session<T> {
        if !self.sessions.contains_key(&fingerprint) && self.sessions.len() >= self.capacity {
            self.evict_one();
        }
        self.sessions
            .entry(fingerprint)
            .or_insert_with(|| Session::new(types, now))
    }

    fn evict_one(&mut self) {
        let victim = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_idle())
            .min_by_key(|(_, s)| s.last_seen())
            .map(|(fp, _)| fp.clone());

        match victim {
            Some(fingerprint) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Evicting idle session {fingerprint} to make room");
                self.sessions.remove(&fingerprint);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Session store over capacity ({} busy sessions, capacity {})",
                    self.sessions.len(),
                    self.capacity
                );
            }
        }
    }

    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions
            .retain(|_, s| !(s.is_idle() && now.saturating_duration_since(s.last_seen()) >= ttl));
        let evicted = before - self.sessions.len();
        #[cfg(feature = "tracing")]
        if evicted > 0 {
            tracing::debug!("Swept {evicted} idle sessions");
        }
        evicted
    }
}
