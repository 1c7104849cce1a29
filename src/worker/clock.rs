use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock milliseconds derived from tokio's monotonic clock.
///
/// Anchored to the system time once, then advanced by `tokio::time::Instant`,
/// so cook deadlines follow paused or auto-advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_millis: i64,
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch_millis: Utc::now().timestamp_millis(),
            origin: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.epoch_millis + self.origin.elapsed().as_millis() as i64
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.now_millis()).unwrap_or_else(Utc::now)
    }
}
