use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::PlayerHandle;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetplayError {
    /// The roster or session parameters are malformed, e.g. a spectator roster
    /// without a player 1 to host it, a missing local entry or duplicate handles.
    InvalidSession {
        /// Further specifies what is wrong with the session.
        info: String,
    },
    /// The session has not finished its handshake with every remote peer.
    NotSynchronized,
    /// Either the local input backlog already spans the whole prediction window
    /// (the caller should idle this tick), or a rollback needed a snapshot that
    /// was already evicted. In the second case the session has been closed.
    PredictionExhausted,
    /// The peer stopped responding and has been declared disconnected.
    PeerTimeout {
        /// The handle of the disconnected peer.
        handle: PlayerHandle,
    },
    /// The rendezvous exchange failed. The traversal can be restarted.
    TraversalFailed {
        /// Why the exchange failed.
        reason: String,
    },
    /// The rendezvous exchange did not complete in time. The traversal can be restarted.
    TraversalTimedOut,
    /// The requested room is already full.
    RoomFull,
    /// No room exists for the given code.
    RoomNotFound,
    /// A datagram could not be parsed. It is dropped and logged.
    MalformedMessage {
        /// A description of the malformed data.
        context: String,
    },
    /// The simulation failed to advance, save or load. Determinism can no longer
    /// be guaranteed, so the session has been closed.
    SimulationFailed {
        /// A description of the failure.
        context: String,
    },
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A network socket operation failed.
    SocketError {
        /// A description of the socket error.
        context: String,
    },
}

impl NetplayError {
    /// Returns `true` for errors that require the session to be restarted.
    ///
    /// [`NetplayError::PredictionExhausted`] is only fatal when it comes from a
    /// rollback; check [`RollbackSession::current_state`] to tell the two apart.
    ///
    /// [`RollbackSession::current_state`]: crate::RollbackSession::current_state
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetplayError::SimulationFailed { .. } | NetplayError::InvalidSession { .. }
        )
    }

    /// Returns `true` for traversal errors after which the exchange may be retried from idle.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NetplayError::TraversalFailed { .. }
                | NetplayError::TraversalTimedOut
                | NetplayError::RoomFull
                | NetplayError::RoomNotFound
                | NetplayError::MalformedMessage { .. }
                | NetplayError::PeerTimeout { .. }
        )
    }
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::InvalidSession { info } => {
                write!(f, "Invalid session: {}", info)
            }
            NetplayError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            NetplayError::PredictionExhausted => {
                write!(
                    f,
                    "Prediction window is exhausted, cannot proceed without catching up."
                )
            }
            NetplayError::PeerTimeout { handle } => {
                write!(f, "Peer {} timed out and was disconnected", handle)
            }
            NetplayError::TraversalFailed { reason } => {
                write!(f, "Traversal failed: {}", reason)
            }
            NetplayError::TraversalTimedOut => {
                write!(f, "Traversal timed out before all peers were exchanged")
            }
            NetplayError::RoomFull => write!(f, "Room full, couldn't join."),
            NetplayError::RoomNotFound => write!(f, "No room found."),
            NetplayError::MalformedMessage { context } => {
                write!(f, "Malformed message: {}", context)
            }
            NetplayError::SimulationFailed { context } => {
                write!(f, "Simulation failed: {}", context)
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            }
            NetplayError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

/// Error returned by a [`Simulation`](crate::Simulation) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimulationError {
    /// A description of what went wrong.
    pub context: String,
}

impl SimulationError {
    /// Creates a new error with the given description.
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

impl Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.context)
    }
}

impl Error for SimulationError {}

impl From<SimulationError> for NetplayError {
    fn from(err: SimulationError) -> Self {
        NetplayError::SimulationFailed {
            context: err.context,
        }
    }
}
