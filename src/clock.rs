//! Time source for the scheduler.
//!
//! Deadlines are computed on a monotonic clock anchored to the Unix epoch at
//! startup, so wall-clock steps cannot make a period fire twice or not at all.
//! Record timestamps still come from the local wall clock.

use chrono::{DateTime, Local, Utc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Time elapsed since the Unix epoch; never goes backwards.
    fn since_epoch(&self) -> Duration;

    /// Local wall-clock time used to stamp records.
    fn local_now(&self) -> DateTime<Local> {
        let t = self.since_epoch();
        DateTime::<Utc>::from_timestamp(t.as_secs() as i64, t.subsec_nanos())
            .map(|utc| utc.with_timezone(&Local))
            .unwrap_or_else(Local::now)
    }

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    anchor_epoch: Duration,
    anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            anchor_epoch: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn since_epoch(&self) -> Duration {
        self.anchor_epoch + self.anchor.elapsed()
    }

    fn local_now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
