use std::fmt;

use crate::{NetplayError, PlayerHandle};

const FIELD_SEPARATOR: &str = "&#";
const HANDLE_SEPARATOR: &str = "~$";

const CREATE_ROOM: &str = "&!CR";
const JOIN_ROOM: &str = "&!JR";
const JOIN_ACK: &str = "&!RJ";
const ROOM_CODE: &str = "&!RCR";
const PEER_INFO: &str = "&!RIE";
const ROOM_CLOSED: &str = "&!RC";
const NO_ROOM_FOUND: &str = "&!NRF";
const ROOM_FULL: &str = "&!RF";

/// The address the local participant is listed under.
pub const LOCAL_ADDRESS: &str = "localhost";

/// One roster entry produced by the rendezvous exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Participant {
    /// Host name or IP address, [`LOCAL_ADDRESS`] for ourselves.
    pub address: String,
    /// UDP port.
    pub port: u16,
    /// Display name.
    pub nickname: String,
    /// Roster handle.
    pub handle: PlayerHandle,
}

impl Participant {
    /// The entry describing this machine.
    #[must_use]
    pub fn local(port: u16, nickname: impl Into<String>, handle: PlayerHandle) -> Self {
        Self {
            address: LOCAL_ADDRESS.to_owned(),
            port,
            nickname: nickname.into(),
            handle,
        }
    }

    /// Parses the payload of a peer-info message, `addr:port&#nickname~$handle`.
    ///
    /// ```
    /// use rollback_netplay::{Participant, PlayerHandle};
    ///
    /// let bob = Participant::parse_remote_info("10.0.0.5:7000&#Bob~$2").unwrap();
    /// assert_eq!(bob.address, "10.0.0.5");
    /// assert_eq!(bob.port, 7000);
    /// assert_eq!(bob.nickname, "Bob");
    /// assert_eq!(bob.handle, PlayerHandle::new(2));
    /// ```
    pub fn parse_remote_info(info: &str) -> Result<Self, NetplayError> {
        let (endpoint, identity) = info
            .split_once(FIELD_SEPARATOR)
            .ok_or_else(|| malformed("peer info without nickname field", info))?;
        let (address, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| malformed("peer endpoint without port", info))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| malformed("peer port is not a number", info))?;
        let (nickname, handle) = identity
            .rsplit_once(HANDLE_SEPARATOR)
            .ok_or_else(|| malformed("peer identity without handle", info))?;
        let handle = handle
            .parse::<u16>()
            .map_err(|_| malformed("peer handle is not a number", info))?;
        if address.is_empty() {
            return Err(malformed("peer address is empty", info));
        }

        Ok(Self {
            address: address.to_owned(),
            port,
            nickname: nickname.to_owned(),
            handle: PlayerHandle::new(handle),
        })
    }

    /// `true` for the entry created by [`Participant::local`].
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.address == LOCAL_ADDRESS
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}, handle {})",
            self.nickname, self.address, self.port, self.handle
        )
    }
}

/// A request sent to the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRequest {
    /// Opens a room for `room_size` participants.
    Create {
        /// Total participants including the host.
        room_size: usize,
        /// Our display name.
        nickname: String,
        /// Our roster handle.
        handle: PlayerHandle,
    },
    /// Joins the room with the given code.
    Join {
        /// Code handed out to the host.
        room_code: String,
        /// Our display name.
        nickname: String,
        /// Our roster handle.
        handle: PlayerHandle,
    },
}

impl RoomRequest {
    /// Renders the ASCII datagram.
    ///
    /// ```
    /// use rollback_netplay::{PlayerHandle, RoomRequest};
    ///
    /// let create = RoomRequest::Create {
    ///     room_size: 3,
    ///     nickname: "Alice".into(),
    ///     handle: PlayerHandle::new(1),
    /// };
    /// assert_eq!(create.encode(), "&!CR&#3&#Alice~$1");
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Create {
                room_size,
                nickname,
                handle,
            } => format!(
                "{CREATE_ROOM}{FIELD_SEPARATOR}{room_size}{FIELD_SEPARATOR}{nickname}{HANDLE_SEPARATOR}{handle}"
            ),
            Self::Join {
                room_code,
                nickname,
                handle,
            } => format!(
                "{JOIN_ROOM}{FIELD_SEPARATOR}{room_code}{FIELD_SEPARATOR}{nickname}{HANDLE_SEPARATOR}{handle}"
            ),
        }
    }

    /// The handle we registered with.
    #[must_use]
    pub fn handle(&self) -> PlayerHandle {
        match self {
            Self::Create { handle, .. } | Self::Join { handle, .. } => *handle,
        }
    }

    /// The nickname we registered with.
    #[must_use]
    pub fn nickname(&self) -> &str {
        match self {
            Self::Create { nickname, .. } | Self::Join { nickname, .. } => nickname,
        }
    }
}

/// A datagram received from the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Our join request was accepted into a room of `room_size`.
    JoinAck {
        /// Total participants including the host.
        room_size: usize,
    },
    /// The code of the room we created.
    RoomCode(String),
    /// Another participant's endpoint.
    PeerInfo(Participant),
    /// The room was closed by its host or the server.
    RoomClosed,
    /// No room exists for the code we sent.
    NoRoomFound,
    /// The room has no free seat.
    RoomFull,
}

impl ServerMessage {
    /// Parses one datagram. Trailing NULs and line breaks are ignored.
    ///
    /// ```
    /// use rollback_netplay::ServerMessage;
    ///
    /// assert_eq!(
    ///     ServerMessage::parse("&!RCR&#K7F2").unwrap(),
    ///     ServerMessage::RoomCode("K7F2".into())
    /// );
    /// assert_eq!(ServerMessage::parse("&!RF").unwrap(), ServerMessage::RoomFull);
    /// assert!(ServerMessage::parse("hello").is_err());
    /// ```
    pub fn parse(datagram: &str) -> Result<Self, NetplayError> {
        let text = datagram.trim_end_matches(['\0', '\r', '\n']);
        let (tag, rest) = match text.split_once(FIELD_SEPARATOR) {
            Some((tag, rest)) => (tag, Some(rest)),
            None => (text, None),
        };

        match (tag, rest) {
            (JOIN_ACK, Some(rest)) => {
                // the room size is always the last field
                let size = rest.rsplit(FIELD_SEPARATOR).next().unwrap_or(rest);
                let room_size = size
                    .parse::<usize>()
                    .map_err(|_| malformed("room size is not a number", text))?;
                Ok(Self::JoinAck { room_size })
            }
            (ROOM_CODE, Some(code)) if !code.is_empty() => Ok(Self::RoomCode(code.to_owned())),
            (PEER_INFO, Some(info)) => Participant::parse_remote_info(info).map(Self::PeerInfo),
            (ROOM_CLOSED, None) => Ok(Self::RoomClosed),
            (NO_ROOM_FOUND, None) => Ok(Self::NoRoomFound),
            (ROOM_FULL, None) => Ok(Self::RoomFull),
            _ => Err(malformed("unknown server message", text)),
        }
    }
}

fn malformed(what: &str, text: &str) -> NetplayError {
    NetplayError::MalformedMessage {
        context: format!("{what}: {text:?}"),
    }
}
