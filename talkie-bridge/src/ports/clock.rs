use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Time source for anything that ages out state.
///
/// `instant` drives idle timers, `now` stamps records; tests swap in a
/// manual clock to avoid sleeping.
pub trait Clock: Send + Sync {
    fn instant(&self) -> Instant;
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
