//! # Rollback Netplay
//!
//! Rollback netplay for frame-deterministic simulations, split into three parts:
//!
//! - [`RollbackSession`]: the roster, input queues and snapshot ring, and the
//!   rollback/resimulation loop that drives a [`Simulation`] each tick.
//! - [`FramePacer`]: turns the session's time-sync signal into a smoothed
//!   per-loop wait so that peers' clocks stay aligned.
//! - [`TraversalClient`]: a small ASCII-over-UDP exchange with a rendezvous
//!   server that produces a roster when peers cannot share addresses directly.
//!
//! The simulation being synchronized is never owned by the session. It is passed
//! in by mutable reference on the calls that need it and is only consumed through
//! the save/load/advance contract of [`Simulation`].

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{fmt::Debug, hash::Hash};

pub use error::{NetplayError, SimulationError};
pub use frame_pacer::FramePacer;
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
pub use network::threaded_socket::ThreadedUdpSocket;
pub use network::udp_socket::UdpNonBlockingSocket;
use serde::{de::DeserializeOwned, Serialize};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolConfig, SessionConfig};
pub use sessions::rollback_session::RollbackSession;
pub use time_sync::TimeSyncConfig;
pub use traversal::client::{TraversalClient, TraversalConfig, TraversalState, TraversalUpdate};
pub use traversal::messages::{Participant, RoomRequest, ServerMessage};

pub mod checksum;
#[doc(hidden)]
pub mod error;
pub mod frame_pacer;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
/// Internal random number generator based on PCG32, used for handshake nonces.
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
pub mod telemetry;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod rollback_session;
}
#[doc(hidden)]
pub mod network {
    /// Binary codec for peer-to-peer message serialization.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[doc(hidden)]
    pub mod threaded_socket;
    #[doc(hidden)]
    pub mod udp_socket;
}
/// Rendezvous-server room exchange used to discover peer endpoints.
pub mod traversal {
    /// Worker-driven client state machine.
    pub mod client;
    /// ASCII wire messages exchanged with the rendezvous server.
    pub mod messages;
}

/// Internal module exposing implementation details for integration tests and benches.
///
/// Nothing in here is covered by semver guarantees.
#[doc(hidden)]
pub mod __internal {
    pub use crate::frame_info::{PlayerInput, SavedSnapshot};
    pub use crate::input_queue::InputQueue;
    pub use crate::network::messages::ConnectionStatus;
    pub use crate::network::protocol::{Event, PeerEndpoint, ProtocolState};
    pub use crate::sync_layer::{SnapshotRing, SyncLayer};
    pub use crate::time_sync::TimeSync;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// Number of frames the simulation may run ahead of confirmed input by default.
pub const NUM_ROLLBACK_FRAMES: usize = 10;

/// Number of loop iterations a time-sync correction is spread across by default.
pub const FRAME_WAIT_SPREAD: u32 = 120;

/// A frame is a single step of simulation.
///
/// Frame numbers start at 0 and increment sequentially. [`Frame::NULL`] (-1)
/// stands for "no frame"; it is also the key of the snapshot taken before the
/// first frame is simulated.
///
/// ```
/// use rollback_netplay::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the earlier of two frames, treating [`Frame::NULL`] as "unknown"
    /// rather than as the smallest value.
    #[inline]
    #[must_use]
    pub fn min_known(self, other: Frame) -> Frame {
        match (self.is_null(), other.is_null()) {
            (true, _) => other,
            (_, true) => self,
            _ => self.min(other),
        }
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// Identifies a roster slot.
///
/// Handles are 1-based, the way rosters are numbered by players and by the
/// rendezvous server: handles `1..=num_players` are players and every larger
/// handle is a spectator. Player `n` reads and writes input slot `n - 1`.
///
/// ```
/// use rollback_netplay::PlayerHandle;
///
/// let p1 = PlayerHandle::new(1);
/// assert!(p1.is_player_for(2));
/// assert_eq!(p1.input_slot(), Some(0));
/// assert!(PlayerHandle::new(3).is_spectator_for(2));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(u16);

impl PlayerHandle {
    /// Player 1, the peer that hosts spectators.
    pub const HOST: PlayerHandle = PlayerHandle(1);

    /// Creates a new `PlayerHandle`.
    #[inline]
    #[must_use]
    pub const fn new(handle: u16) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying handle number.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns `true` if this handle is a player in a session of `num_players`.
    #[inline]
    #[must_use]
    pub const fn is_player_for(self, num_players: usize) -> bool {
        self.0 >= 1 && (self.0 as usize) <= num_players
    }

    /// Returns `true` if this handle is a spectator in a session of `num_players`.
    #[inline]
    #[must_use]
    pub const fn is_spectator_for(self, num_players: usize) -> bool {
        (self.0 as usize) > num_players
    }

    /// Index of this player's column in an input row, `None` for handle 0.
    #[inline]
    #[must_use]
    pub const fn input_slot(self) -> Option<usize> {
        match self.0 {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    /// Inverse of [`input_slot`](Self::input_slot).
    #[inline]
    #[must_use]
    pub const fn from_slot(slot: usize) -> Self {
        PlayerHandle(slot as u16 + 1)
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PlayerHandle {
    #[inline]
    fn from(value: u16) -> Self {
        PlayerHandle(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection by comparing checksums between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DesyncDetection {
    /// Checksums of every `interval`-th confirmed frame are exchanged.
    On {
        /// Frames between two checksum reports.
        interval: u32,
    },
    /// Desync detection is turned off.
    Off,
}

/// The three roles a roster entry can take:
/// - local players, who play on this device,
/// - remote players, who play on other devices and
/// - spectators, who watch from other devices and never contribute input.
///
/// Both [`PlayerType::Remote`] and [`PlayerType::Spectator`] carry the peer's address.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// This player plays on the local device.
    #[default]
    Local,
    /// This player plays on a remote device identified by the address.
    Remote(A),
    /// A spectator on a remote device identified by the address.
    Spectator(A),
}

/// Lifecycle of a [`RollbackSession`].
///
/// ```text
/// Uninitialized -> Initializing -> Synchronizing -> Running -> Closed
///                                                \-> Spectating -/
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Built but not started.
    Uninitialized,
    /// Roster is being registered and endpoints created.
    Initializing,
    /// Handshaking with all remote peers.
    Synchronizing,
    /// Synchronized; local input is accepted and frames advance.
    Running,
    /// Synchronized with the host as a read-only spectator.
    Spectating,
    /// Torn down. Every further call fails until the session is started again.
    Closed,
}

/// Status of a single player's input for a given frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this frame is an actual received input.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame, so this input is a dummy.
    Disconnected,
}

/// Inputs for one frame, one entry per player slot, plus a disconnect bitmask.
///
/// Bit `n` of `disconnect_flags` is set when the player in slot `n` is disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizedInputs<I> {
    /// The frame these inputs belong to.
    pub frame: Frame,
    /// One input per player slot.
    pub inputs: Vec<I>,
    /// Per-slot input status.
    pub statuses: Vec<InputStatus>,
    /// Per-slot disconnected bitmask.
    pub disconnect_flags: u32,
}

/// Notifications emitted by a session. Handling them is up to the caller.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// Handshake progress with a peer.
    Synchronizing {
        /// The peer's roster handle.
        handle: PlayerHandle,
        /// Total number of round trips required.
        total: u32,
        /// Round trips completed so far.
        count: u32,
    },
    /// The handshake with a peer completed.
    Synchronized {
        /// The peer's roster handle.
        handle: PlayerHandle,
    },
    /// Every peer is synchronized; the session is now running or spectating.
    Running,
    /// Nothing was heard from the peer for a while; it will be disconnected
    /// in `disconnect_timeout` ms unless traffic resumes.
    NetworkInterrupted {
        /// The peer's roster handle.
        handle: PlayerHandle,
        /// Milliseconds until the peer is declared disconnected.
        disconnect_timeout: u128,
    },
    /// Sent after [`NetplayEvent::NetworkInterrupted`] once traffic resumes.
    NetworkResumed {
        /// The peer's roster handle.
        handle: PlayerHandle,
    },
    /// The peer timed out. Its input is reported as disconnected from now on.
    Disconnected {
        /// The peer's roster handle.
        handle: PlayerHandle,
    },
    /// Signed frame advantage over the remote peers. Positive means the local
    /// simulation is ahead and should slow down.
    TimeSync {
        /// Frames ahead of the remote peers.
        frames_ahead: f32,
    },
    /// A chat line from a peer, already rendered as `"<nickname>: <text>"`.
    ChatMessage {
        /// The sender's roster handle.
        handle: PlayerHandle,
        /// The rendered line.
        text: String,
    },
    /// Local and remote checksums differ for a confirmed frame.
    DesyncDetected {
        /// Frame of the checksums.
        frame: Frame,
        /// Local checksum for the frame.
        local_checksum: u128,
        /// Remote checksum for the frame.
        remote_checksum: u128,
        /// The peer that reported the remote checksum.
        handle: PlayerHandle,
    },
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// ```
/// use rollback_netplay::Config;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
/// struct PadInput {
///     buttons: u32,
/// }
///
/// struct NetplayConfig;
///
/// impl Config for NetplayConfig {
///     type Input = PadInput;
///     type State = Vec<u8>;
///     type Address = SocketAddr;
/// }
/// ```
pub trait Config: 'static {
    /// The per-frame input of one player. This is the only simulation data
    /// transmitted over the network.
    ///
    /// [`Default`] stands for "no input", including for a disconnected player.
    type Input: Copy + Clone + PartialEq + Default + Debug + Serialize + DeserializeOwned;

    /// The snapshot blob produced by [`Simulation::save`].
    type State: Clone;

    /// The address type which identifies the remote clients.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The deterministic simulation being synchronized.
///
/// A session only ever calls these methods from the thread that owns it.
pub trait Simulation<T: Config> {
    /// Advances the simulation by one frame with one input per player slot.
    /// Bit `n` of `disconnect_flags` is set when slot `n` is disconnected.
    fn advance(&mut self, inputs: &[T::Input], disconnect_flags: u32) -> Result<(), SimulationError>;

    /// Captures the current state together with its checksum.
    fn save(&mut self, frame: Frame) -> Result<(T::State, u128), SimulationError>;

    /// Restores a state previously produced by [`save`](Self::save).
    fn load(&mut self, state: &T::State, frame: Frame) -> Result<(), SimulationError>;

    /// Releases a snapshot that was evicted from the ring.
    fn free(&mut self, state: T::State) {
        drop(state);
    }

    /// Renders a snapshot for diagnostics.
    fn log(&self, state: &T::State) -> String {
        let _ = state;
        String::new()
    }

    /// Called with `true` before a rollback resimulates frames and with `false`
    /// afterwards. Resimulated frames must not emit audio or video.
    fn set_resimulating(&mut self, resimulating: bool) {
        let _ = resimulating;
    }
}

/// A connectionless socket the session sends its [`Message`]s through.
///
/// Messages should be sent in an UDP-like fashion, unordered and unreliable.
/// The session has its own protocol on top to make sure important data arrives.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Takes a [`Message`] and sends it to the given address.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns all messages received since the last time this method was called.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;

    /// The local port, when the socket is bound to one.
    fn local_port(&self) -> Option<u16> {
        None
    }
}
