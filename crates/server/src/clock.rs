//! Receipt timestamps that never run backwards.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Hands out `Utc::now()`, clamped so each value is `>=` the previous one.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    fn observe(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock();
        if wall > *last {
            *last = wall;
        }
        *last
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
