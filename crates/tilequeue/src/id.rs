use core::fmt;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Identifier assigned to every request the dispatcher sees.
///
/// Ids are handed out by a [`SequenceGenerator`] and are unique and strictly
/// increasing for the lifetime of the generator. The display form (`r42`)
/// is what shows up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Wraps a raw sequence number.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw sequence number.
    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A lock-free generator of [`SequenceId`]s.
///
/// The counter lives in an [`AtomicU64`], so a single generator can be shared
/// by every connection task without a lock. A `fetch_add` never hands the
/// same value to two callers, which gives uniqueness; each caller observes
/// its own ids in strictly increasing order.
///
/// ## Caveats
/// The counter wraps after `u64::MAX` ids. At a million requests per second
/// that is roughly half a million years of uptime.
///
/// # Example
/// ```
/// use tilequeue::SequenceGenerator;
///
/// let generator = SequenceGenerator::new();
/// let a = generator.next_id();
/// let b = generator.next_id();
/// assert!(a < b);
/// assert_eq!(a.to_string(), "r0");
/// ```
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Creates a generator whose first id is `r0`.
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a generator whose first id is `start`.
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// The process-wide generator.
    ///
    /// The dispatcher draws every request id from here so that ids stay
    /// unique across listeners in the same process.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<SequenceGenerator> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the next id.
    pub fn next_id(&self) -> SequenceId {
        SequenceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread::scope;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = SequenceGenerator::new();
        let ids: Vec<_> = (0..1_000).map(|_| generator.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids[0], SequenceId::from_raw(0));
        assert_eq!(ids[999].to_raw(), 999);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 4_096;

        let generator = Arc::new(SequenceGenerator::starting_at(10));
        let per_thread: Vec<Vec<SequenceId>> = scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let generator = Arc::clone(&generator);
                    s.spawn(move || {
                        (0..PER_THREAD)
                            .map(|_| generator.next_id())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for ids in &per_thread {
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }

        let all: HashSet<_> = per_thread.into_iter().flatten().collect();
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert!(all.iter().all(|id| id.to_raw() >= 10));
    }

    #[test]
    fn global_generator_is_shared() {
        let a = SequenceGenerator::global().next_id();
        let b = SequenceGenerator::global().next_id();
        assert!(a < b);
    }
}
