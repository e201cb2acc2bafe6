use crate::time::Clock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A monotonic time source aligned to the Unix epoch.
///
/// This avoids wall-clock adjustments (e.g., NTP slews) while keeping
/// readings comparable across service instances that share a remote store:
/// each instance captures `Instant::now()` at construction together with the
/// wall-clock offset at that moment, and afterwards only advances by the
/// monotonic elapsed time.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    start: Instant,
    epoch_offset: f64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Constructs a clock anchored at the current wall-clock time.
    ///
    /// A system clock set before 1970 anchors the clock at zero rather than
    /// failing; readings stay monotonic either way.
    pub fn new() -> Self {
        let epoch_offset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: Instant::now(),
            epoch_offset,
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.epoch_offset + self.start.elapsed().as_secs_f64()
    }
}
