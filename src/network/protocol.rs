use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use smallvec::SmallVec;
use tracing::trace;
use web_time::{Duration, Instant};

use crate::network::codec;
use crate::network::messages::{
    Chat, ChecksumReport, ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader,
    QualityReply, QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::rng::NonceSource;
use crate::sessions::config::ProtocolConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::time_sync::{TimeSync, TimeSyncConfig};
use crate::{Config, DesyncDetection, Frame, NetplayError, NonBlockingSocket, PlayerHandle};

const UDP_HEADER_SIZE: usize = 28; // IP + UDP headers

/// One frame of input, one column per handle the sending endpoint speaks for.
pub type InputRow<I> = SmallVec<[I; 2]>;

fn millis_since_epoch() -> Option<u128> {
    match web_time::SystemTime::now().duration_since(web_time::UNIX_EPOCH) {
        Ok(duration) => Some(duration.as_millis()),
        Err(_) => {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "System time is before UNIX_EPOCH, clock may have gone backwards"
            );
            None
        }
    }
}

/// Lifecycle of one peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Created, handshake not started.
    Initializing,
    /// Exchanging sync requests.
    Synchronizing,
    /// Handshake done, inputs flow.
    Running,
    /// The peer was dropped. Messages are still accepted until shutdown.
    Disconnected,
    /// Terminal. Everything is ignored.
    Shutdown,
}

impl ProtocolState {
    /// Name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Synchronizing => "Synchronizing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Things an endpoint reports to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<I> {
    /// A sync round trip completed.
    Synchronizing {
        /// Round trips required.
        total: u32,
        /// Round trips completed.
        count: u32,
    },
    /// The handshake completed.
    Synchronized,
    /// A confirmed input row arrived for `frame`.
    Input {
        /// Frame of the row.
        frame: Frame,
        /// One input per handle of the endpoint, in handle order.
        row: InputRow<I>,
    },
    /// The peer timed out or asked to disconnect.
    Disconnected,
    /// Nothing received for a while.
    NetworkInterrupted {
        /// Milliseconds left until the peer is disconnected.
        disconnect_timeout: u128,
    },
    /// Traffic resumed after an interruption.
    NetworkResumed,
    /// The peer sent a chat line.
    Chat {
        /// The rendered line.
        text: String,
    },
}

/// Protocol state towards one remote address.
///
/// The endpoint never touches the socket on its own: outgoing messages pile
/// up until [`send_all_messages`](Self::send_all_messages), incoming ones are
/// fed through [`handle_message`](Self::handle_message) and surface as
/// [`Event`]s from [`poll`](Self::poll).
pub struct PeerEndpoint<T>
where
    T: Config,
{
    handles: Vec<PlayerHandle>,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event<T::Input>>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_requests: BTreeSet<u32>,
    sync_requests_sent: u32,
    sync_retry_warning_sent: bool,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,
    pending_output_overflow_sent: bool,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    shutdown_timeout: Instant,
    fps: u32,
    magic: u16,
    config: ProtocolConfig,
    desync_detection: DesyncDetection,

    // the other client
    peer_addr: T::Address,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // outgoing input, resent until acknowledged
    pending_output: VecDeque<(Frame, InputRow<T::Input>)>,
    last_acked_frame: Frame,
    last_recv_frame: Frame,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,

    pending_checksums: BTreeMap<Frame, u128>,
    nonces: NonceSource,
}

impl<T: Config> PeerEndpoint<T> {
    /// Creates an endpoint that receives input for `handles` from `peer_addr`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
        fps: u32,
        desync_detection: DesyncDetection,
        time_sync_config: TimeSyncConfig,
        config: ProtocolConfig,
    ) -> Self {
        let mut nonces = NonceSource::new(config.protocol_rng_seed);
        let magic = nonces.next_magic();
        handles.sort_unstable();
        let now = Instant::now();

        Self {
            handles,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: config.num_sync_packets,
            sync_random_requests: BTreeSet::new(),
            sync_requests_sent: 0,
            sync_retry_warning_sent: false,
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,
            pending_output_overflow_sent: false,

            disconnect_timeout,
            disconnect_notify_start,
            shutdown_timeout: now,
            fps,
            magic,
            config,
            desync_detection,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],

            pending_output: VecDeque::new(),
            last_acked_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,

            time_sync: TimeSync::with_config(time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            pending_checksums: BTreeMap::new(),
            nonces,
        }
    }

    /// Handles whose input this endpoint receives, sorted.
    #[must_use]
    pub fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Our magic number. Never zero.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.magic
    }

    /// `true` once the handshake completed, including after a disconnect.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    /// `true` while inputs flow.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// `true` if messages from `addr` belong to this endpoint.
    #[must_use]
    pub fn is_handling_message(&self, addr: &T::Address) -> bool {
        self.peer_addr == *addr
    }

    /// The peer's address.
    #[must_use]
    pub fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    /// The peer's view of one slot's connection.
    #[must_use]
    pub fn peer_connect_status(&self, slot: usize) -> ConnectionStatus {
        self.peer_connect_status
            .get(slot)
            .copied()
            .unwrap_or_default()
    }

    /// The newest frame received from the peer.
    #[must_use]
    pub fn last_recv_frame(&self) -> Frame {
        self.last_recv_frame
    }

    /// Rolling estimate of how many frames we run ahead of the peer.
    #[must_use]
    pub fn frames_ahead(&self) -> f32 {
        self.time_sync.frames_ahead()
    }

    /// Estimates the peer's current frame from the last received one and half
    /// the round trip, and stores how far it is ahead of `local_frame`.
    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let remote_frame = self.last_recv_frame + ping.saturating_mul(self.fps as i32) / 1000;
        self.local_frame_advantage = remote_frame - local_frame;
    }

    /// Connection quality towards the peer.
    pub fn network_stats(&self) -> Result<NetworkStats, NetplayError> {
        if !matches!(
            self.state,
            ProtocolState::Synchronizing | ProtocolState::Running
        ) {
            return Err(NetplayError::NotSynchronized);
        }
        let seconds = self.stats_start_time.elapsed().as_secs().max(1) as usize;
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;

        Ok(NetworkStats {
            send_queue_len: self.pending_output.len(),
            ping: self.round_trip_time,
            kbps_sent: total_bytes_sent / seconds * 8 / 1000,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
            last_received_ms: self.last_recv_time.elapsed().as_millis(),
        })
    }

    /// Starts the handshake.
    pub fn synchronize(&mut self) -> Result<(), NetplayError> {
        if self.state != ProtocolState::Initializing {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "Cannot synchronize an endpoint in state {}",
                    self.state.as_str()
                ),
            });
        }
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = self.config.num_sync_packets;
        self.stats_start_time = Instant::now();
        self.send_sync_request();
        Ok(())
    }

    /// Drops the peer. Messages are still processed until the shutdown delay passes.
    pub fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        self.state = ProtocolState::Disconnected;
        self.shutdown_timeout = Instant::now() + self.config.shutdown_delay;
    }

    /// Drives timers and returns the accumulated events.
    pub fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event<T::Input>> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Synchronizing => {
                if self.last_send_time + self.config.sync_retry_interval < now {
                    self.send_sync_request();
                }
            }
            ProtocolState::Running => {
                if self.running_last_input_recv + self.config.running_retry_interval < now {
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = now;
                }

                if self.running_last_quality_report + self.config.quality_report_interval < now {
                    self.send_quality_report();
                }

                if self.last_send_time + self.config.keepalive_interval < now {
                    self.send_keep_alive();
                }

                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.disconnect_notify_start < now
                {
                    let remaining = self.disconnect_timeout - self.disconnect_notify_start;
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: remaining.as_millis(),
                    });
                    self.disconnect_notify_sent = true;
                }

                if !self.disconnect_event_sent && self.last_recv_time + self.disconnect_timeout < now
                {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            }
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < now {
                    self.state = ProtocolState::Shutdown;
                }
            }
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    /*
     *  SENDING MESSAGES
     */

    /// Flushes queued messages to the socket.
    pub fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket<T::Address>) {
        if self.state == ProtocolState::Shutdown {
            trace!(
                "Endpoint is shut down; dropping {} messages",
                self.send_queue.len()
            );
            self.send_queue.clear();
            return;
        }
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues an input row for `frame`. Every unacknowledged row is resent with it.
    pub fn send_input(
        &mut self,
        frame: Frame,
        row: InputRow<T::Input>,
        connect_status: &[ConnectionStatus],
    ) {
        if self.state != ProtocolState::Running {
            return;
        }

        self.time_sync.advance_frame(
            frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );

        if let Some((last, _)) = self.pending_output.back() {
            if frame != *last + 1 {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Input row for frame {} does not follow pending frame {}",
                    frame,
                    last
                );
                return;
            }
        }
        self.pending_output.push_back((frame, row));

        if self.pending_output.len() > self.config.pending_output_limit
            && !self.pending_output_overflow_sent
        {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{} input rows unacknowledged by {:?}, dropping peer",
                self.pending_output.len(),
                self.peer_addr
            );
            self.pending_output_overflow_sent = true;
            self.event_queue.push_back(Event::Disconnected);
        }

        self.send_pending_output(connect_status);
    }

    /// Sends a rendered chat line.
    pub fn send_chat(&mut self, text: &str) {
        self.queue_message(MessageBody::Chat(Chat {
            text: text.to_owned(),
        }));
    }

    /// Sends the checksum of a confirmed frame.
    pub fn send_checksum_report(&mut self, frame: Frame, checksum: u128) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport { checksum, frame }));
    }

    /// Removes and returns the peer's checksums for frames up to `frame`.
    pub fn take_checksums_through(&mut self, frame: Frame) -> Vec<(Frame, u128)> {
        let newer = self.pending_checksums.split_off(&(frame + 1));
        std::mem::replace(&mut self.pending_checksums, newer)
            .into_iter()
            .collect()
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some((frame, _)) = self.pending_output.front() {
            if *frame > ack_frame {
                break;
            }
            self.last_acked_frame = *frame;
            self.pending_output.pop_front();
        }
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let Some((start_frame, _)) = self.pending_output.front() else {
            return;
        };
        let start_frame = *start_frame;
        let rows: Vec<&InputRow<T::Input>> = self.pending_output.iter().map(|(_, row)| row).collect();
        let bytes = match codec::encode(&rows) {
            Ok(bytes) => bytes,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to encode {} input rows: {}",
                    rows.len(),
                    e
                );
                return;
            }
        };
        trace!(
            rows = rows.len(),
            bytes = bytes.len(),
            %start_frame,
            "sending pending input"
        );

        let body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.state == ProtocolState::Disconnected,
            start_frame,
            ack_frame: self.last_recv_frame,
            bytes,
        };
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame,
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        self.sync_requests_sent += 1;
        if !self.sync_retry_warning_sent
            && self.sync_requests_sent > self.config.sync_retry_warning_threshold
        {
            self.sync_retry_warning_sent = true;
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Excessive sync retries: {} requests sent to {:?}",
                self.sync_requests_sent,
                self.peer_addr
            );
        }

        let random_request = self.nonces.next_u32();
        self.sync_random_requests.insert(random_request);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { random_request }));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();
        let Some(ping) = millis_since_epoch() else {
            return;
        };
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage,
            ping,
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        trace!("Queuing message to {:?}: {:?}", self.peer_addr, body);
        let msg = Message {
            header: MessageHeader { magic: self.magic },
            body,
        };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += codec::encode(&msg).map_or(0, |bytes| bytes.len());

        self.send_queue.push_back(msg);
    }

    /*
     *  RECEIVING MESSAGES
     */

    /// Applies one message from the peer.
    pub fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            trace!("Endpoint is shut down; ignoring message");
            return;
        }
        // a different magic after sync means a stale session on the same address
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            trace!("Ignoring message with magic {}", msg.header.magic);
            return;
        }

        self.last_recv_time = Instant::now();

        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.pop_pending_output(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::ChecksumReport(body) => self.on_checksum_report(*body),
            MessageBody::Chat(body) => self.event_queue.push_back(Event::Chat {
                text: body.text.clone(),
            }),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply {
            random_reply: body.random_request,
        }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        if !self.sync_random_requests.remove(&body.random_reply) {
            return;
        }
        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(Event::Synchronizing {
                total: self.config.num_sync_packets,
                count: self.config.num_sync_packets - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            self.state = ProtocolState::Running;
            self.remote_magic = header.magic;
            self.running_last_input_recv = Instant::now();
            self.event_queue.push_back(Event::Synchronized);
        }
    }

    fn on_input(&mut self, body: &Input) {
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = local.last_frame.max(remote.last_frame);
            }
        }

        if !self.last_recv_frame.is_null() && body.start_frame > self.last_recv_frame + 1 {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Input for frame {} skips past last received frame {}, waiting for resend",
                body.start_frame,
                self.last_recv_frame
            );
            return;
        }

        let rows: Vec<InputRow<T::Input>> = match codec::decode_value(&body.bytes) {
            Ok(rows) => rows,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to decode input rows: {}",
                    e
                );
                return;
            }
        };
        self.running_last_input_recv = Instant::now();

        for (offset, row) in rows.into_iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if !self.last_recv_frame.is_null() && frame <= self.last_recv_frame {
                continue;
            }
            if row.len() != self.handles.len() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Input row for frame {} has {} columns, expected {}",
                    frame,
                    row.len(),
                    self.handles.len()
                );
                return;
            }
            self.last_recv_frame = frame;
            self.event_queue.push_back(Event::Input { frame, row });
        }

        self.send_input_ack();
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: QualityReply) {
        let Some(millis) = millis_since_epoch() else {
            return;
        };
        self.round_trip_time = millis.saturating_sub(body.pong);
    }

    fn on_checksum_report(&mut self, body: ChecksumReport) {
        let interval = match self.desync_detection {
            DesyncDetection::On { interval } => interval,
            DesyncDetection::Off => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Configuration,
                    "Received checksum report, but desync detection is off"
                );
                1
            }
        };

        let max_history = self.config.max_checksum_history;
        if self.pending_checksums.len() >= max_history {
            let span = (max_history as i32 - 1).saturating_mul(interval as i32);
            let oldest_to_keep = body.frame - span;
            self.pending_checksums
                .retain(|&frame, _| frame >= oldest_to_keep);
        }
        self.pending_checksums.insert(body.frame, body.checksum);
    }
}
