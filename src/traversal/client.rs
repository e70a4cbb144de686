use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::traversal::messages::{Participant, RoomRequest, ServerMessage};
use crate::{NetplayError, PlayerHandle};

/// Port of the rendezvous server.
pub const DEFAULT_SERVER_PORT: u16 = 4420;

const RECV_BUFFER_SIZE: usize = 512;

/// Where and how to run the rendezvous exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalConfig {
    /// Rendezvous server. Default: `127.0.0.1:4420`.
    pub server: SocketAddr,
    /// Local port to bind, 0 for any. The session later binds the same port.
    pub local_port: u16,
    /// Sleep between two receive checks. Default: 200ms.
    pub poll_interval: Duration,
    /// Give up after this long without completing. Default: 60s.
    pub exchange_timeout: Duration,
    /// Our display name.
    pub nickname: String,
    /// Our roster handle. The room creator is usually player 1.
    pub handle: PlayerHandle,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SERVER_PORT)),
            local_port: 0,
            poll_interval: Duration::from_millis(200),
            exchange_timeout: Duration::from_secs(60),
            nickname: String::from("Player"),
            handle: PlayerHandle::HOST,
        }
    }
}

/// Progress of one exchange.
///
/// ```text
/// Idle -> SocketOpen -> AwaitingServerAck -> ExchangingPeers -> Complete
///                                                           \-> Failed | TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    /// No exchange running. A new one may be started.
    Idle,
    /// The local socket is bound.
    SocketOpen,
    /// The room request was sent.
    AwaitingServerAck,
    /// The server acknowledged the room; peers are being announced.
    ExchangingPeers,
    /// Every participant is known. The socket is closed.
    Complete,
    /// The server refused, the room closed, the exchange was cancelled or a
    /// socket error occurred. The socket is closed.
    Failed,
    /// The exchange timeout elapsed. The socket is closed.
    TimedOut,
}

impl TraversalState {
    /// `true` once the exchange ended and its socket is closed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::TimedOut)
    }
}

/// Messages from the exchange worker to whoever started it.
#[derive(Debug, Clone, PartialEq)]
pub enum TraversalUpdate {
    /// Human readable progress.
    Status(String),
    /// The server assigned this code to our room.
    RoomCode(String),
    /// We were admitted into a room of this size.
    RoomJoined {
        /// Total participants including ourselves.
        room_size: usize,
    },
    /// A participant was announced.
    PeerJoined(Participant),
    /// The full roster, ourselves first.
    Complete(Vec<Participant>),
    /// The exchange ended without a roster. It can be restarted.
    Failed(NetplayError),
}

/// Rendezvous client producing a roster for
/// [`RollbackSession::start_traversal`](crate::RollbackSession::start_traversal).
///
/// Each exchange runs on its own worker thread that polls a non-blocking
/// socket every [`TraversalConfig::poll_interval`] and reports through the
/// returned channel.
///
/// ```no_run
/// use rollback_netplay::{TraversalClient, TraversalConfig, TraversalUpdate};
///
/// let mut client = TraversalClient::new(TraversalConfig::default());
/// let updates = client.create_room(0)?;
/// for update in updates {
///     match update {
///         TraversalUpdate::RoomCode(code) => println!("share this code: {code}"),
///         TraversalUpdate::Complete(roster) => println!("{} participants", roster.len()),
///         TraversalUpdate::Failed(err) => println!("failed: {err}"),
///         _ => {}
///     }
/// }
/// # Ok::<(), rollback_netplay::NetplayError>(())
/// ```
#[derive(Debug)]
pub struct TraversalClient {
    config: TraversalConfig,
    state: Arc<Mutex<TraversalState>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TraversalClient {
    /// Creates an idle client.
    #[must_use]
    pub fn new(config: TraversalConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TraversalState::Idle)),
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// The configuration of the next exchange.
    #[must_use]
    pub fn config(&self) -> &TraversalConfig {
        &self.config
    }

    /// Mutable configuration. Changes apply to the next exchange.
    pub fn config_mut(&mut self) -> &mut TraversalConfig {
        &mut self.config
    }

    /// Current state of the exchange.
    #[must_use]
    pub fn state(&self) -> TraversalState {
        *self.state.lock()
    }

    /// Opens a room for two players plus `spectators`.
    pub fn create_room(&mut self, spectators: usize) -> Result<Receiver<TraversalUpdate>, NetplayError> {
        let room_size = spectators + 2;
        let request = RoomRequest::Create {
            room_size,
            nickname: self.config.nickname.clone(),
            handle: self.config.handle,
        };
        self.begin(request, Some(room_size))
    }

    /// Joins an existing room. The room size arrives with the server's acknowledgement.
    pub fn join_room(&mut self, room_code: &str) -> Result<Receiver<TraversalUpdate>, NetplayError> {
        let request = RoomRequest::Join {
            room_code: room_code.to_owned(),
            nickname: self.config.nickname.clone(),
            handle: self.config.handle,
        };
        self.begin(request, None)
    }

    /// Asks the worker to stop. It notices within one poll interval and
    /// reports [`TraversalUpdate::Failed`]. Safe to call at any time.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Blocks until the current worker, if any, has finished.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("traversal worker panicked");
                *self.state.lock() = TraversalState::Failed;
            }
        }
    }

    fn begin(
        &mut self,
        request: RoomRequest,
        room_size: Option<usize>,
    ) -> Result<Receiver<TraversalUpdate>, NetplayError> {
        let state = self.state();
        if self.worker.is_some() && !state.is_terminal() {
            return Err(NetplayError::InvalidRequest {
                info: format!("A traversal exchange is already running ({state:?})"),
            });
        }
        self.wait();

        *self.state.lock() = TraversalState::Idle;
        self.cancel.store(false, Ordering::Release);
        let (updates, receiver) = mpsc::channel();

        let exchange = Exchange {
            config: self.config.clone(),
            request,
            state: Arc::clone(&self.state),
            cancel: Arc::clone(&self.cancel),
            updates,
            socket: None,
            room: TraversalRoom {
                room_size,
                ..TraversalRoom::default()
            },
        };
        let worker = std::thread::Builder::new()
            .name("netplay-traversal".to_owned())
            .spawn(move || exchange.run())
            .map_err(|e| NetplayError::SocketError {
                context: format!("failed to spawn traversal worker: {e}"),
            })?;
        self.worker = Some(worker);
        Ok(receiver)
    }
}

impl Drop for TraversalClient {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// The pending room of one exchange.
#[derive(Debug, Default)]
struct TraversalRoom {
    room_size: Option<usize>,
    room_code: Option<String>,
    remotes: Vec<Participant>,
}

impl TraversalRoom {
    fn is_complete(&self) -> bool {
        self.room_size
            .is_some_and(|size| self.remotes.len() + 1 == size)
    }
}

/// Worker side of one exchange. Owns the socket until a terminal state.
struct Exchange {
    config: TraversalConfig,
    request: RoomRequest,
    state: Arc<Mutex<TraversalState>>,
    cancel: Arc<AtomicBool>,
    updates: Sender<TraversalUpdate>,
    socket: Option<UdpSocket>,
    room: TraversalRoom,
}

impl Exchange {
    fn run(mut self) {
        let outcome = self.exchange();
        // closed before reporting so the session can bind the same port right away
        self.close_socket();
        match outcome {
            Ok(roster) => {
                info!(participants = roster.len(), "traversal complete");
                self.transition(TraversalState::Complete);
                self.report(TraversalUpdate::Complete(roster));
            }
            Err(err) => {
                let state = if err == NetplayError::TraversalTimedOut {
                    TraversalState::TimedOut
                } else {
                    TraversalState::Failed
                };
                info!(error = %err, "traversal ended without a roster");
                self.transition(state);
                self.report(TraversalUpdate::Status(err.to_string()));
                self.report(TraversalUpdate::Failed(err));
            }
        }
    }

    fn exchange(&mut self) -> Result<Vec<Participant>, NetplayError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.local_port))
            .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
            .map_err(|e| socket_error("bind", &e))?;
        let local_port = socket
            .local_addr()
            .map_err(|e| socket_error("local_addr", &e))?
            .port();
        self.socket = Some(socket);
        self.transition(TraversalState::SocketOpen);
        debug!(port = local_port, "traversal socket open");

        self.send_request()?;
        self.transition(TraversalState::AwaitingServerAck);
        self.report(TraversalUpdate::Status(format!(
            "Contacting rendezvous server {}",
            self.config.server
        )));

        let started = Instant::now();
        let mut buffer = [0_u8; RECV_BUFFER_SIZE];
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(NetplayError::TraversalFailed {
                    reason: "cancelled".to_owned(),
                });
            }
            if started.elapsed() > self.config.exchange_timeout {
                return Err(NetplayError::TraversalTimedOut);
            }

            while let Some((len, from)) = self.try_recv(&mut buffer)? {
                if from != self.config.server {
                    debug!(%from, "ignoring datagram from unknown sender");
                    continue;
                }
                let datagram = buffer.get(..len).unwrap_or_default();
                let text = String::from_utf8_lossy(datagram).into_owned();
                let msg = match ServerMessage::parse(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        report_violation!(
                            ViolationSeverity::Warning,
                            ViolationKind::Traversal,
                            "Dropping server datagram: {}",
                            e
                        );
                        continue;
                    }
                };
                self.apply(msg)?;
                if self.room.is_complete() {
                    let mut roster = Vec::with_capacity(self.room.remotes.len() + 1);
                    roster.push(Participant::local(
                        local_port,
                        self.request.nickname(),
                        self.request.handle(),
                    ));
                    roster.append(&mut self.room.remotes);
                    return Ok(roster);
                }
            }

            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn apply(&mut self, msg: ServerMessage) -> Result<(), NetplayError> {
        debug!(?msg, "rendezvous message");
        match msg {
            ServerMessage::JoinAck { room_size } => {
                self.room.room_size = Some(room_size);
                self.transition(TraversalState::ExchangingPeers);
                self.report(TraversalUpdate::RoomJoined { room_size });
                self.report_waiting();
            }
            ServerMessage::RoomCode(code) => {
                self.room.room_code = Some(code.clone());
                self.transition(TraversalState::ExchangingPeers);
                self.report(TraversalUpdate::RoomCode(code));
                self.report_waiting();
            }
            ServerMessage::PeerInfo(peer) => {
                let known = peer.handle == self.request.handle()
                    || self.room.remotes.iter().any(|p| p.handle == peer.handle);
                if known {
                    debug!(handle = %peer.handle, "ignoring repeated peer info");
                    return Ok(());
                }
                self.room.remotes.push(peer.clone());
                self.report(TraversalUpdate::PeerJoined(peer));
                self.report_waiting();
            }
            ServerMessage::RoomClosed => {
                return Err(NetplayError::TraversalFailed {
                    reason: "room closed by server".to_owned(),
                });
            }
            ServerMessage::NoRoomFound => return Err(NetplayError::RoomNotFound),
            ServerMessage::RoomFull => return Err(NetplayError::RoomFull),
        }
        Ok(())
    }

    fn send_request(&self) -> Result<(), NetplayError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(NetplayError::SocketError {
                context: "traversal socket is closed".to_owned(),
            });
        };
        let text = self.request.encode();
        socket
            .send_to(text.as_bytes(), self.config.server)
            .map_err(|e| socket_error("send_to", &e))?;
        debug!(request = %text, server = %self.config.server, "sent room request");
        Ok(())
    }

    fn try_recv(&self, buffer: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, NetplayError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        match socket.recv_from(buffer) {
            Ok(received) => Ok(Some(received)),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // the server is not up yet
            Err(ref e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(socket_error("recv_from", &e)),
        }
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            drop(socket);
            debug!("traversal socket closed");
        }
    }

    fn transition(&self, next: TraversalState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(from = ?*state, to = ?next, "traversal state");
            *state = next;
        }
    }

    fn report_waiting(&self) {
        if let Some(size) = self.room.room_size {
            self.report(TraversalUpdate::Status(format!(
                "Waiting for players ({}/{})",
                self.room.remotes.len() + 1,
                size
            )));
        }
    }

    fn report(&self, update: TraversalUpdate) {
        // the receiver may have been dropped; the exchange still runs to its end
        let _ = self.updates.send(update);
    }
}

fn socket_error(operation: &str, err: &std::io::Error) -> NetplayError {
    NetplayError::SocketError {
        context: format!("traversal {operation} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(handle: u16) -> Participant {
        Participant {
            address: "10.0.0.1".to_owned(),
            port: 7000 + handle,
            nickname: format!("p{handle}"),
            handle: PlayerHandle::new(handle),
        }
    }

    #[test]
    fn defaults_point_at_local_server() {
        let config = TraversalConfig::default();
        assert_eq!(config.server.port(), DEFAULT_SERVER_PORT);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn room_completes_when_all_remotes_are_known() {
        let mut room = TraversalRoom::default();
        room.remotes.push(participant(2));
        assert!(!room.is_complete());
        room.room_size = Some(3);
        assert!(!room.is_complete());
        room.remotes.push(participant(3));
        assert!(room.is_complete());
    }

    #[test]
    fn terminal_states() {
        assert!(!TraversalState::Idle.is_terminal());
        assert!(!TraversalState::ExchangingPeers.is_terminal());
        assert!(TraversalState::Complete.is_terminal());
        assert!(TraversalState::TimedOut.is_terminal());
    }

    #[test]
    fn new_client_is_idle() {
        let client = TraversalClient::new(TraversalConfig::default());
        assert_eq!(client.state(), TraversalState::Idle);
    }
}
