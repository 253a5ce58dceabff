// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments.
use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. A negative delta is zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    /// The moment `dur` before this one, or this moment if the clock
    /// does not reach back that far.
    pub fn saturating_sub(&self, dur: Duration) -> Self {
        match self.inner.checked_sub(dur) {
            Some(inner) => Moment { inner },
            None => *self,
        }
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deltas() {
        let now = Moment::now();
        let later = now + Duration::from_millis(1500);
        assert_eq!(later.delta_as_millis(now), 1500);
        assert_eq!(now.delta_as_millis(later), 0);
    }
}
