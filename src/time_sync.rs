use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

/// Default window size for the frame advantage average.
const DEFAULT_FRAME_WINDOW_SIZE: usize = 30;

/// Default number of frames between two time-sync events.
const DEFAULT_EVENT_INTERVAL: u32 = 60;

/// Configuration for time synchronization.
///
/// ```
/// use rollback_netplay::TimeSyncConfig;
///
/// let smooth = TimeSyncConfig {
///     window_size: 60,
///     ..TimeSyncConfig::default()
/// };
/// assert_eq!(smooth.event_interval, 60);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncConfig {
    /// The number of frames to average when calculating frame advantage.
    /// Larger windows are steadier but slower to react.
    ///
    /// Default: 30 frames (0.5 seconds at 60 FPS)
    pub window_size: usize,
    /// Frames between two [`NetplayEvent::TimeSync`](crate::NetplayEvent::TimeSync) events.
    ///
    /// Default: 60 frames
    pub event_interval: u32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_FRAME_WINDOW_SIZE,
            event_interval: DEFAULT_EVENT_INTERVAL,
        }
    }
}

impl TimeSyncConfig {
    /// Small window, reacts quickly to network changes.
    #[must_use]
    pub fn responsive() -> Self {
        Self {
            window_size: 15,
            event_interval: 30,
        }
    }

    /// Large window, steady pacing on jittery links.
    #[must_use]
    pub fn smooth() -> Self {
        Self {
            window_size: 60,
            ..Self::default()
        }
    }

    /// Small window for stable LAN links.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            window_size: 10,
            ..Self::default()
        }
    }
}

/// Tracks local and remote frame advantage over a rolling window.
///
/// The local advantage is how far the remote peer's frame is ahead of ours as
/// we estimate it; the remote advantage is the same figure as the peer reports it.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    window_size: usize,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a new TimeSync with the given configuration.
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            window_size,
        }
    }

    /// Records the advantages measured for `frame`.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "TimeSync::advance_frame called with invalid frame {}, skipping update",
                frame
            );
            return;
        }
        let slot = frame.as_i32() as usize % self.window_size;
        self.local[slot] = local_adv;
        self.remote[slot] = remote_adv;
    }

    /// Frames the local simulation runs ahead of the remote one. Positive means
    /// we should slow down; negative means we are behind.
    #[must_use]
    pub fn frames_ahead(&self) -> f32 {
        let local_avg = self.local.iter().sum::<i32>() as f32 / self.window_size as f32;
        let remote_avg = self.remote.iter().sum::<i32>() as f32 / self.window_size as f32;

        // meet in the middle
        (remote_avg - local_avg) / 2.0
    }
}

#[cfg(test)]
mod time_sync_tests {
    use super::*;

    fn fill(time_sync: &mut TimeSync, local_adv: i32, remote_adv: i32) {
        for i in 0..60 {
            time_sync.advance_frame(Frame::new(i), local_adv, remote_adv);
        }
    }

    #[test]
    fn no_advantage() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 0, 0);
        assert!(time_sync.frames_ahead().abs() < f32::EPSILON);
    }

    #[test]
    fn remote_ahead_means_local_behind() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, 5, -5);
        assert!((time_sync.frames_ahead() + 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn local_ahead_is_positive() {
        let mut time_sync = TimeSync::default();
        fill(&mut time_sync, -2, 2);
        assert!((time_sync.frames_ahead() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn partial_window_is_averaged() {
        let mut time_sync = TimeSync::with_config(TimeSyncConfig {
            window_size: 4,
            ..TimeSyncConfig::default()
        });
        time_sync.advance_frame(Frame::new(0), 0, 4);
        assert!((time_sync.frames_ahead() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn invalid_frame_is_skipped() {
        let mut time_sync = TimeSync::default();
        time_sync.advance_frame(Frame::NULL, 10, 10);
        assert!(time_sync.frames_ahead().abs() < f32::EPSILON);
    }

    #[test]
    fn zero_window_is_clamped() {
        let time_sync = TimeSync::with_config(TimeSyncConfig {
            window_size: 0,
            ..TimeSyncConfig::default()
        });
        assert!(time_sync.frames_ahead().abs() < f32::EPSILON);
    }
}
