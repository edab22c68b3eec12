//! Time keeping for session key management.
//!
//! Session tokens carry absolute validity windows, so key management works on
//! wall-clock [Timing] values supplied by a [Clock]. Network operations on the
//! other hand are bounded by monotonic [Deadline]s.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::sync::MutexExt;

/// A point in time or a time span, in seconds
pub type Timing = f64;

/// Tolerance applied by [has_happened] so that events scheduled for "now" are
/// treated as having happened despite floating point noise
pub const EVENT_GRACE: Timing = 0.0025;

/// An event `ev` has happened relative to a point in time `now`
/// if `ev` does not lie in the future relative to `now`.
///
/// Think of this as `ev <= now` with [EVENT_GRACE] applied.
///
/// # Examples
///
/// ```
/// use secure_session_util::time::{has_happened, EVENT_GRACE};
/// assert!(has_happened(EVENT_GRACE * -1.0, 0.0));
/// assert!(has_happened(0.0, 0.0));
/// assert!(has_happened(EVENT_GRACE * 0.999, 0.0));
/// assert!(!has_happened(EVENT_GRACE * 1.001, 0.0));
/// ```
pub fn has_happened(ev: Timing, now: Timing) -> bool {
    (ev - now) < EVENT_GRACE
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + Debug {
    /// Current time in seconds
    fn now(&self) -> Timing;
}

/// Seconds since the unix epoch
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timing {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hold one handle while the code
/// under test reads another.
///
/// ```
/// use secure_session_util::time::{Clock, ManualClock};
/// let clock = ManualClock::new(100.0);
/// let observer = clock.clone();
/// clock.advance(5.0);
/// assert_eq!(observer.now(), 105.0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<Mutex<Timing>>);

impl ManualClock {
    pub fn new(start: Timing) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: Timing) {
        *self.0.lock_unpoisoned() += by;
    }

    pub fn set(&self, to: Timing) {
        *self.0.lock_unpoisoned() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timing {
        *self.0.lock_unpoisoned()
    }
}

/// Convert a [Timing] span into a [Duration], clamping negative spans to zero
pub fn dur(t: Timing) -> Duration {
    Duration::try_from_secs_f64(t).unwrap_or(Duration::ZERO)
}

/// A fixed point in monotonic time by which a compound operation must finish.
///
/// Each step of the operation gets [Deadline::remaining] as its own timeout.
#[derive(Clone, Copy, Debug)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        // Saturate instead of panicking on absurd timeouts
        Self(now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86400 * 365)))
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn instant(&self) -> Instant {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dur_clamps_negative_spans() {
        assert_eq!(dur(-1.0), Duration::ZERO);
        assert_eq!(dur(1.5), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn deadline_counts_down() {
        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(!deadline.expired());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn manual_clock_set() {
        let clock = ManualClock::new(1.0);
        clock.set(42.0);
        assert_eq!(clock.now(), 42.0);
    }
}
