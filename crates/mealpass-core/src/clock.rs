//! Wall-clock source for the renewal scheduler.

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with the tokio runtime clock. Under paused time
/// (`tokio::time::pause`/`advance`) deadlines and timers move together.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self {
            anchor: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.started.elapsed()).unwrap_or(Duration::zero());
        self.anchor + elapsed
    }
}
