use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Wall-clock source used for outage bookkeeping and retry pacing.
///
/// Production code uses [`SystemClock`]; tests drive a [`ManualClock`] so
/// outage durations and retry windows can be exercised without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Pause between reconnect attempts. Manual clocks advance instead of
    /// blocking.
    fn sleep(&self, dur: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> ManualClock {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, dur: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += dur;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, dur: Duration) {
        self.advance(dur);
    }
}
