//! Time types in the DW1000's 40-bit system time domain
//!
//! One tick is 1 / (128 · 499.2 MHz), roughly 15.65 ps. Timestamps wrap after
//! 2^40 ticks (about 17.2 s), so all arithmetic here is modular.

use core::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// The maximum value of 40-bit system time stamps
pub const TIME_MAX: u64 = 0xff_ffff_ffff;

/// Tick rate of the system time counter, in ticks per second
pub const TICKS_PER_SECOND: f64 = 499.2e6 * 128.0;

/// Length of one tick in seconds
pub const TIME_RES: f32 = 1.0 / (499.2e6 * 128.0);

/// Low bits of DX_TIME the chip ignores when scheduling
pub const DX_TIME_IGNORED_MASK: u64 = 0x1ff;

/// A point in DW1000 system time
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Returns `None` if `value` doesn't fit in 40 bits
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        } else {
            None
        }
    }

    /// Wraps an arbitrary value into the 40-bit range
    pub fn wrapping(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// Returns the raw 40-bit timestamp
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, assuming less than one wrap happened
    ///
    /// ```rust
    /// use dw1000::time::{Instant, TIME_MAX};
    ///
    /// let before = Instant::wrapping(TIME_MAX);
    /// let after = Instant::wrapping(49);
    /// assert_eq!(after.duration_since(before).value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0) & TIME_MAX)
    }

    /// The instant the chip will actually use when this is written to DX_TIME
    pub fn scheduled(&self) -> Instant {
        Instant(self.0 & !DX_TIME_IGNORED_MASK)
    }

    /// Signed difference `self - other` in ticks, for instants less than half
    /// a wrap apart
    pub fn signed_diff(&self, other: Instant) -> i64 {
        let diff = self.0.wrapping_sub(other.0) & TIME_MAX;
        if diff > TIME_MAX / 2 {
            diff as i64 - (TIME_MAX as i64 + 1)
        } else {
            diff as i64
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Instant::wrapping(self.0 + rhs.0)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Instant::wrapping(self.0.wrapping_sub(rhs.0))
    }
}

/// A span of DW1000 system time
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Returns `None` if `value` doesn't fit in 40 bits
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        } else {
            None
        }
    }

    /// Converts nanoseconds to ticks
    pub fn from_nanos(nanos: u32) -> Self {
        // 32 bit input times 63898 stays well below 2^40.
        Duration(nanos as u64 * 638_976 / 10_000)
    }

    /// Converts microseconds to ticks, saturating at `TIME_MAX`
    pub fn from_micros(micros: u32) -> Self {
        Duration((micros as u64 * 638_976 / 10).min(TIME_MAX))
    }

    /// Returns the number of ticks
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whole microseconds in this duration
    pub fn as_micros(&self) -> u64 {
        self.0 * 10 / 638_976
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration((self.0 + rhs.0).min(TIME_MAX))
    }
}
