//! Wrapping millisecond timestamps.
//!
//! The board's monotonic counter is 32 bits wide and wraps roughly every
//! 49.7 days. Two timestamps are only ever compared through
//! [`Millis::elapsed_since`], which stays correct across a wrap as long as the
//! real gap is shorter than the wrap period.

use core::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Millis(u32);

impl Millis {
    pub const fn from_raw(ms: u32) -> Self {
        Self(ms)
    }

    /// Truncates a wide monotonic counter to the wrapping 32-bit domain.
    pub const fn from_u64(ms: u64) -> Self {
        Self(ms as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn elapsed_since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub const fn has_elapsed(self, since: Millis, interval_ms: u32) -> bool {
        self.elapsed_since(since) >= interval_ms
    }

    pub const fn offset(self, ms: u32) -> Millis {
        Self(self.0.wrapping_add(ms))
    }

    /// True once `self` has reached `deadline`, i.e. `deadline` lies at most
    /// half a wrap period in the past.
    pub const fn reached(self, deadline: Millis) -> bool {
        self.elapsed_since(deadline) < u32::MAX / 2
    }

    /// Whole seconds between `earlier` and `self`.
    pub const fn secs_since(self, earlier: Millis) -> u32 {
        self.elapsed_since(earlier) / 1_000
    }
}

/// Keeps consecutive ticks at least `interval_ms` apart.
#[derive(Debug, Clone, Copy)]
pub struct TickPacer {
    interval_ms: u32,
}

impl TickPacer {
    pub const fn new(interval_ms: u32) -> Self {
        Self { interval_ms }
    }

    pub fn remaining(&self, tick_start: Millis, now: Millis) -> Duration {
        let spent = now.elapsed_since(tick_start);
        Duration::from_millis(u64::from(self.interval_ms.saturating_sub(spent)))
    }
}
