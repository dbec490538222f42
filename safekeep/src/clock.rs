//! Time sources
//!
//! Everything that measures elapsed time (click windows, breaker cooldowns,
//! error-rate windows) reads it through [`Clock`] so tests can drive it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};

/// Clock trait for testable time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn now_utc(&self) -> SystemTime;

    /// Wall-clock time as a chrono timestamp
    fn now_datetime(&self) -> DateTime<Utc> {
        self.now_utc().into()
    }
}

/// Real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
    fn now_utc(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to the component under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    instant: Arc<Mutex<Instant>>,
    system_time: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            instant: Arc::new(Mutex::new(Instant::now())),
            system_time: Arc::new(Mutex::new(SystemTime::now())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.lock().unwrap_or_else(|e| e.into_inner()) += duration;
        *self.system_time.lock().unwrap_or_else(|e| e.into_inner()) += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.instant.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_utc(&self) -> SystemTime {
        *self.system_time.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_sources() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_utc = clock.now_utc();

        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now().duration_since(start), Duration::from_millis(250));
        assert_eq!(
            clock.now_utc().duration_since(start_utc).unwrap(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        handle.advance(Duration::from_secs(3));
        assert_eq!(clock.now(), handle.now());
    }
}
