use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};

/// Injected time source.
///
/// All TTL, retry and blackout logic consumes [`Clock::now`], a monotonic
/// offset from an arbitrary reference point. Wall-clock time is consulted only
/// for `$CCCLK` and for messages that embed timestamps. `sleep` exists because
/// the Micro-Modem protocol requires a handful of genuine blocking waits (the
/// 1-50 ms clock alignment, the settle time after `$CCCLK` and after a
/// reboot); routing those through the clock keeps tests instantaneous.
pub trait Clock {
    /// Monotonic time since this clock's reference point.
    fn now(&self) -> Duration;

    /// Current UTC wall-clock time.
    fn wall_time(&self) -> NaiveDateTime;

    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The real thing: `Instant` for monotonic time, `chrono::Utc` for wall time,
/// `std::thread::sleep` for waits.
pub struct SystemClock {
    reference_time: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            reference_time: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.reference_time.elapsed()
    }

    fn wall_time(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A manually advanced clock for tests and simulation. `sleep` advances the
/// clock instead of blocking, so protocol timeouts measured in seconds run in
/// microseconds under test.
#[derive(Clone)]
pub struct SimClock {
    state: Rc<RefCell<SimClockState>>,
}

struct SimClockState {
    now: Duration,
    wall: NaiveDateTime,
}

impl SimClock {
    /// Starts at monotonic zero and the given wall-clock time.
    pub fn starting_at(wall: NaiveDateTime) -> SimClock {
        SimClock {
            state: Rc::new(RefCell::new(SimClockState {
                now: Duration::ZERO,
                wall,
            })),
        }
    }

    pub fn new() -> SimClock {
        SimClock::starting_at(
            chrono::NaiveDate::from_ymd_opt(2012, 4, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.borrow_mut();
        state.now += duration;
        state.wall += chrono::Duration::from_std(duration).expect("duration out of range");
    }
}

impl Default for SimClock {
    fn default() -> Self {
        SimClock::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.state.borrow().now
    }

    fn wall_time(&self) -> NaiveDateTime {
        self.state.borrow().wall
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
