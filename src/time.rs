// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time source used by the concentrator and the samplers.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of "now" in nanoseconds since the Unix epoch.
///
/// All time comparisons in the pipeline go through a `Clock` so tests can
/// drive them with a [`ManualClock`].
pub trait Clock: Send + Sync + Debug {
    fn now_ns(&self) -> i64;
}

/// Wall-anchored monotonic clock.
///
/// The wall clock is read once at construction and subsequent readings add
/// the monotonic time elapsed since, so `now_ns` never jumps backwards if
/// the system clock is stepped while the pipeline runs.
#[derive(Debug)]
pub struct SystemClock {
    wall_anchor_ns: i64,
    monotonic_anchor: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        SystemClock {
            wall_anchor_ns: wall.as_nanos() as i64,
            monotonic_anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        self.wall_anchor_ns + self.monotonic_anchor.elapsed().as_nanos() as i64
    }
}

/// Clock driven by hand, for tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ns: i64) -> Self {
        ManualClock {
            now_ns: AtomicI64::new(now_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: i64) {
        self.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotone() {
        let clock = SystemClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_ns(), 42);
    }
}
