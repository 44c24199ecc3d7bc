//! Time sources for window arithmetic.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Clock abstraction so window aging can be driven by tests.
///
/// Wall-clock time is used rather than `Instant` because the distributed
/// strategy scores events by timestamp and those scores are compared across
/// process instances.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A settable clock shared between a test and the limiter under test.
///
/// Clones observe the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time (may move backwards to simulate skew).
    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Nanoseconds since the Unix epoch, zero for earlier times.
pub fn epoch_nanos(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Whole seconds since the Unix epoch, zero for earlier times.
pub fn epoch_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(
            clock.now().duration_since(start).unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));

        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn test_epoch_helpers() {
        let at = UNIX_EPOCH + Duration::new(42, 7);
        assert_eq!(epoch_secs(at), 42);
        assert_eq!(epoch_nanos(at), 42_000_000_007);

        let before_epoch = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(epoch_secs(before_epoch), 0);
        assert_eq!(epoch_nanos(before_epoch), 0);
    }
}
