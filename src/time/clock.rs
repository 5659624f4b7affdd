// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Add;
use core::time::Duration;

use crate::time::TimeError;

/// A duration expressed in clock ticks.
///
/// What a tick *means* is decided by the [`Clock`] that produced it, via its
/// [`tick_duration`](Clock::tick_duration).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Ticks(pub u64);

/// A point in time, measured in [`Ticks`] since the clock's start.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(Ticks);

/// A monotonic time source.
///
/// A `Clock` is a plain `fn() -> u64` returning the current tick count, plus
/// the [`Duration`] one tick represents. The function must be monotonic; the
/// timer clamps small regressions but a clock that jumps backwards defeats
/// every deadline in flight.
#[derive(Clone)]
pub struct Clock {
    name: &'static str,
    tick_duration: Duration,
    now: fn() -> u64,
}

// === impl Ticks ===

impl Ticks {
    #[must_use]
    pub const fn saturating_add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(rhs.0))
    }

    #[must_use]
    pub const fn saturating_sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        self.saturating_add(rhs)
    }
}

// === impl Instant ===

impl Instant {
    #[must_use]
    pub const fn from_ticks(ticks: Ticks) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn as_ticks(self) -> Ticks {
        self.0
    }

    /// Ticks from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub const fn ticks_since(self, earlier: Instant) -> Ticks {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Ticks> for Instant {
    type Output = Instant;

    fn add(self, rhs: Ticks) -> Instant {
        Instant(self.0 + rhs)
    }
}

// === impl Clock ===

impl Clock {
    /// Creates a new `Clock` from the provided `tick_duration` and tick
    /// source.
    ///
    /// The `tick_duration` is the `Duration` of time represented by a single
    /// tick of this clock, in effect its precision. It must be non-zero.
    #[must_use]
    pub const fn new(tick_duration: Duration, now: fn() -> u64) -> Self {
        Self {
            name: "<unnamed mystery clock>",
            tick_duration,
            now,
        }
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the time source backing the tick
    /// function.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Returns this `Clock`'s name, if it was given one using [`Clock::named`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the [`Duration`] of one tick of this clock.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// The longest [`Duration`] that can be converted to ticks of this clock.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        self.tick_duration.saturating_mul(u32::MAX)
    }

    #[inline]
    #[must_use]
    pub fn now_ticks(&self) -> Ticks {
        Ticks((self.now)())
    }

    #[inline]
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::from_ticks(self.now_ticks())
    }

    /// The [`Instant`] that lies `after` from now.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::DurationTooLong`] if `after` exceeds
    /// [`max_duration`](Self::max_duration).
    pub fn deadline(&self, after: Duration) -> Result<Instant, TimeError> {
        Ok(self.now() + self.duration_to_ticks(after)?)
    }

    /// Converts a [`Duration`] into a tick count of this clock, rounding down.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::DurationTooLong`] if `duration` exceeds
    /// [`max_duration`](Self::max_duration).
    pub fn duration_to_ticks(&self, duration: Duration) -> Result<Ticks, TimeError> {
        let ticks = duration.as_nanos() / self.tick_duration.as_nanos();
        match u32::try_from(ticks) {
            Ok(ticks) => Ok(Ticks(u64::from(ticks))),
            Err(_) => Err(TimeError::DurationTooLong {
                requested: duration,
                max: self.max_duration(),
            }),
        }
    }

    /// Converts a tick count of this clock back into a [`Duration`],
    /// saturating at [`Duration::MAX`].
    #[must_use]
    pub fn ticks_to_duration(&self, ticks: Ticks) -> Duration {
        u32::try_from(ticks.0).map_or(Duration::MAX, |ticks| {
            self.tick_duration.saturating_mul(ticks)
        })
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("tick_duration", &self.tick_duration)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?} precision", self.name, self.tick_duration)
    }
}
