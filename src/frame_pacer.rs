//! Loop pacing driven by time-sync events.
//!
//! The simulation loop sleeps [`FramePacer::wait_this_loop`] microseconds per
//! iteration. Normally that is one frame at the target rate. When the session
//! reports that the local simulation runs ahead (or behind) its peers, the
//! correction is not applied at once: half the measured advantage is converted
//! into extra (or missing) wait and spread evenly over the next
//! `spread_frames` iterations.

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Converts "frames ahead" signals into a smoothed per-loop wait schedule.
///
/// ```
/// use rollback_netplay::FramePacer;
///
/// let mut pacer = FramePacer::new(60, 120);
/// assert_eq!(pacer.wait_this_loop(), 16_666);
///
/// pacer.on_time_sync_event(2.0);
/// let total: i64 = (0..120).map(|_| pacer.wait_this_loop()).sum();
/// assert_eq!(total, 16_666 * 120 + 16_667);
/// assert_eq!(pacer.wait_count(), 0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FramePacer {
    us_per_loop: i64,
    spread_frames: u32,
    last_advantage_ms: f32,
    extra_us_per_loop: i64,
    // leftover of the integer division, paid out one microsecond per loop
    remainder_us: i64,
    wait_count: u32,
}

impl FramePacer {
    /// Creates a pacer for `target_fps` that spreads each correction over
    /// `spread_frames` loop iterations. Zero values are clamped to one.
    #[must_use]
    pub fn new(target_fps: u32, spread_frames: u32) -> Self {
        if target_fps == 0 || spread_frames == 0 {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Configuration,
                "FramePacer created with fps={} spread={}, clamping to 1",
                target_fps,
                spread_frames
            );
        }
        Self {
            us_per_loop: 1_000_000 / i64::from(target_fps.max(1)),
            spread_frames: spread_frames.max(1),
            last_advantage_ms: 0.0,
            extra_us_per_loop: 0,
            remainder_us: 0,
            wait_count: 0,
        }
    }

    /// Baseline wait of one loop iteration in microseconds.
    #[must_use]
    pub fn baseline_us(&self) -> i64 {
        self.us_per_loop
    }

    /// Loop iterations left in the current correction.
    #[must_use]
    pub fn wait_count(&self) -> u32 {
        self.wait_count
    }

    /// The advantage in milliseconds derived from the last event.
    #[must_use]
    pub fn last_advantage_ms(&self) -> f32 {
        self.last_advantage_ms
    }

    /// Extra microseconds not yet paid out by [`wait_this_loop`](Self::wait_this_loop).
    #[must_use]
    pub fn outstanding_extra_us(&self) -> i64 {
        self.extra_us_per_loop * i64::from(self.wait_count) + self.remainder_us
    }

    /// Starts a new correction for a signed frame advantage. Positive values
    /// lengthen the next waits, negative values shorten them.
    pub fn on_time_sync_event(&mut self, frames_ahead: f32) {
        // halved to damp oscillation from both peers correcting at once
        self.last_advantage_ms = frames_ahead * (1000.0 / 60.0) / 2.0;
        let total_us = (f64::from(self.last_advantage_ms) * 1000.0).round() as i64;
        let spread = i64::from(self.spread_frames);

        if total_us == 0 {
            self.extra_us_per_loop = 0;
            self.remainder_us = 0;
            self.wait_count = 0;
            return;
        }
        self.extra_us_per_loop = total_us / spread;
        self.remainder_us = total_us % spread;
        self.wait_count = self.spread_frames;
        tracing::trace!(
            frames_ahead,
            total_us,
            spread = self.spread_frames,
            "frame pacer correction"
        );
    }

    /// Microseconds the current loop iteration should take.
    pub fn wait_this_loop(&mut self) -> i64 {
        let mut wait = self.us_per_loop;
        if self.wait_count > 0 {
            wait += self.extra_us_per_loop;
            if self.remainder_us != 0 {
                let step = self.remainder_us.signum();
                wait += step;
                self.remainder_us -= step;
            }
            self.wait_count -= 1;
            if self.wait_count == 0 {
                self.extra_us_per_loop = 0;
                self.remainder_us = 0;
            }
        }
        wait
    }
}
