use std::time::Instant;

/// Source of "now" for session bookkeeping.
///
/// Production code uses [`MonotonicClock`]; tests substitute a clock they can
/// move forward by hand.
pub trait TimeSource {
    fn now(&self) -> Instant;
}

/// The system's monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl TimeSource for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
