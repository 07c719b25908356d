//! Millisecond timeouts and their conversion to kernel ticks.
//!
//! Callers speak milliseconds; kernels speak ticks. A [`Timeout`] is the
//! tri-state caller-side bound and a [`Wait`] is what gets handed to the
//! kernel after conversion with the kernel's tick rate.

/// System time in milliseconds, wrapping at `u32::MAX`.
pub type SysTime = u32;

/// Block without bound.
pub const INFINITE_DELAY: SysTime = SysTime::MAX;

/// Longest bounded delay; anything larger is clamped.
pub const MAX_DELAY: SysTime = INFINITE_DELAY / 2;

/// Caller-side wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Timeout {
    /// Check once and return immediately.
    Poll,
    /// Block for at most this many milliseconds.
    Millis(SysTime),
    /// Block until the object is signaled.
    Infinite,
}

impl Timeout {
    /// Decode the integer encoding: `0` polls, [`INFINITE_DELAY`] blocks
    /// forever, anything else is a duration clamped to [`MAX_DELAY`].
    pub const fn from_millis(ms: SysTime) -> Self {
        match ms {
            0 => Timeout::Poll,
            INFINITE_DELAY => Timeout::Infinite,
            ms if ms > MAX_DELAY => Timeout::Millis(MAX_DELAY),
            ms => Timeout::Millis(ms),
        }
    }

    /// Integer encoding of this timeout, the inverse of [`Timeout::from_millis`].
    pub const fn as_millis(self) -> SysTime {
        match self {
            Timeout::Poll => 0,
            Timeout::Millis(ms) => ms,
            Timeout::Infinite => INFINITE_DELAY,
        }
    }

    /// Convert to a kernel wait for a kernel ticking at `tick_rate_hz`.
    pub const fn to_wait(self, tick_rate_hz: u32) -> Wait {
        match self {
            Timeout::Poll => Wait::NoWait,
            Timeout::Infinite => Wait::Forever,
            Timeout::Millis(ms) => match ms_to_ticks(ms, tick_rate_hz) {
                0 => Wait::NoWait,
                ticks => Wait::Ticks(ticks),
            },
        }
    }
}

impl From<SysTime> for Timeout {
    fn from(ms: SysTime) -> Self {
        Timeout::from_millis(ms)
    }
}

/// Kernel-side wait bound, in native ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Wait {
    /// Non-blocking attempt.
    NoWait,
    /// Block for at most this many ticks (never zero).
    Ticks(u32),
    /// Block without bound.
    Forever,
}

/// Milliseconds to ticks, rounded up so a nonzero delay never becomes a poll.
pub const fn ms_to_ticks(ms: SysTime, tick_rate_hz: u32) -> u32 {
    let ticks = (ms as u64 * tick_rate_hz as u64).div_ceil(1000);
    if ticks > u32::MAX as u64 {
        u32::MAX
    } else {
        ticks as u32
    }
}

/// Ticks to milliseconds, rounded down.
pub const fn ticks_to_ms(ticks: u64, tick_rate_hz: u32) -> u64 {
    let hz = tick_rate_hz as u64;
    (ticks / hz) * 1000 + (ticks % hz) * 1000 / hz
}

/// Signed distance `t1 - t2` between two wrapping timestamps.
///
/// Positive when `t1` is later than `t2`, valid as long as the two are less
/// than half the clock range apart.
pub const fn time_compare(t1: SysTime, t2: SysTime) -> i32 {
    t1.wrapping_sub(t2) as i32
}
