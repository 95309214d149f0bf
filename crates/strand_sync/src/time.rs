//! Time units and the monotonic clock.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::Interrupted;
use crate::thread;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A granularity for expressing durations as plain integers.
///
/// Conversion between equal units is the identity. Converting a duration to a
/// coarser unit truncates toward zero; converting to a finer unit saturates at
/// the representable extremes instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeUnit {
    /// One billionth of a second.
    Nanoseconds,
    /// One millionth of a second.
    Microseconds,
    /// One thousandth of a second.
    Milliseconds,
    /// One second.
    Seconds,
}

impl TimeUnit {
    /// The number of nanoseconds that make up one of this unit.
    pub const fn nanos_per(self) -> i64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => NANOS_PER_MICRO,
            TimeUnit::Milliseconds => NANOS_PER_MILLI,
            TimeUnit::Seconds => NANOS_PER_SEC,
        }
    }

    /// Converts `duration`, expressed in `from`, into this unit.
    ///
    /// Going to a coarser unit truncates toward zero, so
    /// `Seconds.convert(999, Milliseconds) == 0`. Going to a finer unit
    /// saturates at `i64::MAX` (or `i64::MIN` for negative durations).
    pub fn convert(self, duration: i64, from: TimeUnit) -> i64 {
        let from_nanos = from.nanos_per();
        let to_nanos = self.nanos_per();
        if from_nanos == to_nanos {
            duration
        } else if from_nanos < to_nanos {
            duration / (to_nanos / from_nanos)
        } else {
            duration.saturating_mul(from_nanos / to_nanos)
        }
    }

    /// Converts `duration`, expressed in this unit, into nanoseconds,
    /// saturating at the representable extremes.
    pub fn to_nanos(self, duration: i64) -> i64 {
        duration.saturating_mul(self.nanos_per())
    }

    /// Suspends the calling thread for at least `duration` of this unit.
    ///
    /// Durations of zero or less return immediately. Fails with
    /// [`Interrupted`] (consuming the interrupt flag) if the thread is
    /// interrupted before or during the sleep.
    pub fn sleep(self, duration: i64) -> Result<(), Interrupted> {
        thread::check_interrupt()?;
        let nanos = self.to_nanos(duration);
        if nanos <= 0 {
            return Ok(());
        }
        let deadline = Instant::now().saturating_add_nanos(nanos);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_for(deadline.saturating_duration_since(now));
            thread::check_interrupt()?;
        }
    }
}

/// A point on the monotonic clock, in nanoseconds from a process-local
/// origin.
///
/// Instants never decrease; only differences between them are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    nanos: i64,
}

impl Instant {
    /// Reads the monotonic clock.
    pub fn now() -> Self {
        static ORIGIN: OnceLock<std::time::Instant> = OnceLock::new();
        let origin = *ORIGIN.get_or_init(std::time::Instant::now);
        let nanos = origin.elapsed().as_nanos().min(i64::MAX as u128) as i64;
        Self { nanos }
    }

    /// Builds an instant from a raw nanosecond count.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Returns the raw nanosecond count of this instant.
    pub const fn as_nanos(self) -> i64 {
        self.nanos
    }

    /// Offsets the instant forwards.
    ///
    /// Returns `None` if the result is not representable.
    pub fn checked_add_nanos(self, nanos: i64) -> Option<Self> {
        self.nanos.checked_add(nanos).map(Self::from_nanos)
    }

    /// Offsets the instant forwards, saturating at the representable
    /// extremes.
    pub fn saturating_add_nanos(self, nanos: i64) -> Self {
        Self::from_nanos(self.nanos.saturating_add(nanos))
    }

    /// Returns the time elapsed from `earlier` to `self`, or `None` if
    /// `earlier` is the later of the two.
    pub fn checked_duration_since(self, earlier: Self) -> Option<Duration> {
        if earlier.nanos > self.nanos {
            return None;
        }
        Some(Duration::from_nanos((self.nanos - earlier.nanos) as u64))
    }

    /// Returns the time elapsed from `earlier` to `self`, or zero if
    /// `earlier` is the later of the two.
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or(Duration::ZERO)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        let nanos = i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX);
        self.saturating_add_nanos(nanos)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        let nanos = i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX);
        Self::from_nanos(self.nanos.saturating_sub(nanos))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}
