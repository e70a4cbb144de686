use std::marker::PhantomData;

use web_time::Duration;

use crate::sessions::config::{ProtocolConfig, SessionConfig};
use crate::time_sync::TimeSyncConfig;
use crate::{Config, DesyncDetection, NetplayError, RollbackSession};

/// Builds a [`RollbackSession`] from a validated [`SessionConfig`].
///
/// Every setter overrides one field; [`build`](Self::build) checks the whole
/// configuration at once.
///
/// ```
/// use rollback_netplay::{Config, SessionBuilder, SessionState};
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
/// use web_time::Duration;
///
/// #[derive(Copy, Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
/// struct Pad(u8);
///
/// struct Netplay;
/// impl Config for Netplay {
///     type Input = Pad;
///     type State = Vec<u8>;
///     type Address = SocketAddr;
/// }
///
/// let session = SessionBuilder::<Netplay>::new()
///     .with_num_players(2)
///     .with_disconnect_timeout(Duration::from_millis(2000))
///     .with_nickname("Alice")
///     .build()?;
/// assert_eq!(session.current_state(), SessionState::Uninitialized);
/// # Ok::<(), rollback_netplay::NetplayError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling build()"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    config: SessionConfig,
    _config: PhantomData<T>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Starts from [`SessionConfig::default`].
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            _config: PhantomData,
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of player slots. Handles above it are spectators.
    pub fn with_num_players(mut self, num_players: usize) -> Self {
        self.config.num_players = num_players;
        self
    }

    /// Default input delay, used until [`RollbackSession::start`] sets its own.
    pub fn with_input_delay(mut self, delay: usize) -> Self {
        self.config.input_delay = delay;
        self
    }

    /// Default prediction window, used until [`RollbackSession::start`] sets its own.
    pub fn with_prediction_window(mut self, window: usize) -> Self {
        self.config.prediction_window = window;
        self
    }

    /// Silence after which a peer is disconnected.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.config.disconnect_timeout = timeout;
        self
    }

    /// Silence after which a peer is reported as interrupted. Must be shorter
    /// than the disconnect timeout.
    pub fn with_disconnect_notify_start(mut self, notify_start: Duration) -> Self {
        self.config.disconnect_notify_start = notify_start;
        self
    }

    /// Simulation rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    /// Loop iterations a time-sync correction is spread across.
    pub fn with_frame_wait_spread(mut self, spread: u32) -> Self {
        self.config.frame_wait_spread = spread;
        self
    }

    /// Checksum exchange between peers.
    pub fn with_desync_detection(mut self, desync_detection: DesyncDetection) -> Self {
        self.config.desync_detection = desync_detection;
        self
    }

    /// Prefix of outgoing chat lines.
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.config.nickname = nickname.into();
        self
    }

    /// Frame advantage averaging.
    pub fn with_time_sync_config(mut self, time_sync: TimeSyncConfig) -> Self {
        self.config.time_sync = time_sync;
        self
    }

    /// Protocol timings.
    pub fn with_protocol_config(mut self, protocol: ProtocolConfig) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Validates the configuration and returns an unstarted session.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InvalidRequest`] naming the first field out of range.
    pub fn build(self) -> Result<RollbackSession<T>, NetplayError> {
        self.config.validate()?;
        Ok(RollbackSession::new(self.config))
    }
}
