//! Session and protocol configuration.
//!
//! Both structs are plain data with defaults matching a 60 FPS peer-to-peer
//! match over the internet. Override fields with struct update syntax and hand
//! the result to [`SessionBuilder`](crate::SessionBuilder), which validates it.

use web_time::Duration;

use crate::input_queue::{INPUT_QUEUE_LENGTH, MAX_FRAME_DELAY};
use crate::time_sync::TimeSyncConfig;
use crate::{DesyncDetection, NetplayError, FRAME_WAIT_SPREAD, NUM_ROLLBACK_FRAMES};

/// The disconnect bitmask handed to the simulation is a `u32`.
pub const MAX_PLAYERS: usize = 32;

/// Timing and bookkeeping knobs of the peer-to-peer protocol.
///
/// ```
/// use rollback_netplay::ProtocolConfig;
/// use web_time::Duration;
///
/// let lan = ProtocolConfig {
///     sync_retry_interval: Duration::from_millis(50),
///     ..ProtocolConfig::default()
/// };
/// assert!(lan.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Successful sync round trips required before a peer counts as synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,

    /// Time between sync request retries while synchronizing.
    ///
    /// Default: 200ms
    pub sync_retry_interval: Duration,

    /// Resend unacknowledged input after this long without hearing input back.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// Send a keepalive after this long without sending anything.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,

    /// Interval between quality reports, which measure round trip time and
    /// exchange frame advantage.
    ///
    /// Default: 200ms
    pub quality_report_interval: Duration,

    /// Time spent in `Disconnected` before the endpoint stops processing messages.
    ///
    /// Default: 5000ms
    pub shutdown_delay: Duration,

    /// Remote checksums retained for desync detection.
    ///
    /// Default: 32
    pub max_checksum_history: usize,

    /// Unacknowledged input rows after which the peer is considered gone.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Emit a warning after this many sync requests.
    ///
    /// Default: 10
    pub sync_retry_warning_threshold: u32,

    /// Seed for magic numbers and sync nonces. `None` draws them from entropy.
    ///
    /// Default: `None`
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
            quality_report_interval: Duration::from_millis(200),
            shutdown_delay: Duration::from_millis(5000),
            max_checksum_history: 32,
            pending_output_limit: 128,
            sync_retry_warning_threshold: 10,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Creates a new `ProtocolConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Faster retries and reports for LAN play.
    pub fn competitive() -> Self {
        Self {
            sync_retry_interval: Duration::from_millis(100),
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            quality_report_interval: Duration::from_millis(100),
            shutdown_delay: Duration::from_millis(3000),
            ..Self::default()
        }
    }

    /// Default values with a fixed RNG seed, for reproducible handshakes.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] naming the first bad field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        check_range("num_sync_packets", u64::from(self.num_sync_packets), 1, 100)?;
        check_duration("sync_retry_interval", self.sync_retry_interval, 1, 10_000)?;
        check_duration("running_retry_interval", self.running_retry_interval, 1, 10_000)?;
        check_duration("keepalive_interval", self.keepalive_interval, 1, 10_000)?;
        check_duration("quality_report_interval", self.quality_report_interval, 1, 10_000)?;
        check_duration("shutdown_delay", self.shutdown_delay, 1, 300_000)?;
        check_range("max_checksum_history", self.max_checksum_history as u64, 1, 1024)?;
        check_range("pending_output_limit", self.pending_output_limit as u64, 1, 4096)?;
        check_range(
            "sync_retry_warning_threshold",
            u64::from(self.sync_retry_warning_threshold),
            1,
            1000,
        )
    }
}

/// Everything a [`RollbackSession`](crate::RollbackSession) needs besides its roster.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "SessionConfig has no effect unless passed to SessionBuilder::with_config()"]
pub struct SessionConfig {
    /// Number of player slots. Handles above this are spectators.
    ///
    /// Default: 2
    pub num_players: usize,
    /// Frames of delay applied to local input. Overridden by `start`.
    ///
    /// Default: 0
    pub input_delay: usize,
    /// Frames the simulation may run ahead of confirmed input. Overridden by `start`.
    ///
    /// Default: [`NUM_ROLLBACK_FRAMES`]
    pub prediction_window: usize,
    /// Silence after which a peer is declared disconnected.
    ///
    /// Default: 3000ms
    pub disconnect_timeout: Duration,
    /// Silence after which a peer is reported as interrupted.
    ///
    /// Default: 1000ms
    pub disconnect_notify_start: Duration,
    /// Simulation rate, used for frame advantage estimates and pacing.
    ///
    /// Default: 60
    pub fps: u32,
    /// Loop iterations a time-sync correction is spread across.
    ///
    /// Default: [`FRAME_WAIT_SPREAD`]
    pub frame_wait_spread: u32,
    /// Checksum exchange between peers.
    ///
    /// Default: [`DesyncDetection::Off`]
    pub desync_detection: DesyncDetection,
    /// Prefix of outgoing chat lines.
    ///
    /// Default: `"Player"`
    pub nickname: String,
    /// Frame advantage averaging.
    pub time_sync: TimeSyncConfig,
    /// Protocol timings.
    pub protocol: ProtocolConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_players: 2,
            input_delay: 0,
            prediction_window: NUM_ROLLBACK_FRAMES,
            disconnect_timeout: Duration::from_millis(3000),
            disconnect_notify_start: Duration::from_millis(1000),
            fps: 60,
            frame_wait_spread: FRAME_WAIT_SPREAD,
            desync_detection: DesyncDetection::Off,
            nickname: String::from("Player"),
            time_sync: TimeSyncConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::InvalidRequest`] naming the first bad field.
    pub fn validate(&self) -> Result<(), NetplayError> {
        check_range("num_players", self.num_players as u64, 1, MAX_PLAYERS as u64)?;
        check_range(
            "input_delay",
            self.input_delay as u64,
            0,
            MAX_FRAME_DELAY as u64,
        )?;
        check_range("prediction_window", self.prediction_window as u64, 1, 64)?;
        // every unconfirmed frame plus the delayed one must fit the input ring
        if self.input_delay + self.prediction_window + 1 > INPUT_QUEUE_LENGTH {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "input_delay ({}) + prediction_window ({}) must stay below {}",
                    self.input_delay, self.prediction_window, INPUT_QUEUE_LENGTH
                ),
            });
        }
        check_range("fps", u64::from(self.fps), 1, 1000)?;
        check_range("frame_wait_spread", u64::from(self.frame_wait_spread), 1, 10_000)?;
        if self.disconnect_notify_start >= self.disconnect_timeout {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "disconnect_notify_start ({}ms) must be shorter than disconnect_timeout ({}ms)",
                    self.disconnect_notify_start.as_millis(),
                    self.disconnect_timeout.as_millis()
                ),
            });
        }
        if let DesyncDetection::On { interval: 0 } = self.desync_detection {
            return Err(NetplayError::InvalidRequest {
                info: "desync detection interval must be at least 1".to_owned(),
            });
        }
        self.protocol.validate()
    }
}

fn check_range(field: &str, actual: u64, min: u64, max: u64) -> Result<(), NetplayError> {
    if actual < min || actual > max {
        return Err(NetplayError::InvalidRequest {
            info: format!("{field} must be within {min}..={max}, got {actual}"),
        });
    }
    Ok(())
}

fn check_duration(field: &str, actual: Duration, min_ms: u64, max_ms: u64) -> Result<(), NetplayError> {
    check_range(field, actual.as_millis() as u64, min_ms, max_ms)
}
