use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};

use smallvec::smallvec;
use tracing::{debug, info, trace, warn};
use web_time::Duration;

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, InputRow, PeerEndpoint, ProtocolState};
use crate::network::threaded_socket::ThreadedUdpSocket;
use crate::report_violation;
use crate::sessions::config::SessionConfig;
use crate::sync_layer::SyncLayer;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::traversal::messages::Participant;
use crate::{
    Config, DesyncDetection, Frame, FramePacer, InputStatus, NetplayError, NetplayEvent,
    NonBlockingSocket, PlayerHandle, PlayerType, SessionState, Simulation, SynchronizedInputs,
};

/// Events kept until the caller drains them. Older ones are discarded.
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A spectator further behind the host than this advances two frames per tick.
const SPECTATOR_CATCHUP_THRESHOLD: i32 = 10;

/// A rollback netplay session between one local player (or spectator) and its peers.
///
/// The session is single-writer: every method is called from the thread that
/// owns the [`Simulation`]. Network receipt may happen on another thread (see
/// [`ThreadedUdpSocket`]), but inbound messages are only applied when the
/// session drains its socket at the start of [`tick`](Self::tick) or
/// [`poll_remote_clients`](Self::poll_remote_clients).
///
/// A typical loop:
///
/// ```ignore
/// let mut session = SessionBuilder::<MyConfig>::new().with_num_players(2).build()?;
/// session.start_udp(PlayerHandle::new(1), 7000, &roster, 2, 8)?;
/// loop {
///     let wait = session.tick(&mut game, read_pad())?;
///     for event in session.events() {
///         handle(event);
///     }
///     std::thread::sleep(wait);
/// }
/// ```
pub struct RollbackSession<T>
where
    T: Config,
{
    config: SessionConfig,
    state: SessionState,
    local_handle: Option<PlayerHandle>,
    input_delay: usize,
    prediction_window: usize,

    socket: Option<Box<dyn NonBlockingSocket<T::Address>>>,
    /// Remote players, or the host while spectating, keyed by address.
    players: BTreeMap<T::Address, PeerEndpoint<T>>,
    /// Spectators hosted by player 1.
    spectators: BTreeMap<T::Address, PeerEndpoint<T>>,

    sync_layer: SyncLayer<T>,
    local_connect_status: Vec<ConnectionStatus>,
    /// Frame the local input was last added for.
    local_input_frame: Frame,
    /// Earliest frame whose inputs changed because a player disconnected.
    pending_disconnect_frame: Frame,
    next_spectator_frame: Frame,

    local_checksums: BTreeMap<Frame, u128>,
    last_sent_checksum_frame: Frame,

    frame_pacer: FramePacer,
    events: VecDeque<NetplayEvent>,
}

impl<T: Config> std::fmt::Debug for RollbackSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackSession")
            .field("state", &self.state)
            .field("local_handle", &self.local_handle)
            .field("current_frame", &self.sync_layer.current_frame())
            .field("confirmed_frame", &self.sync_layer.last_confirmed_frame())
            .field("players", &self.players.len())
            .field("spectators", &self.spectators.len())
            .finish_non_exhaustive()
    }
}

impl<T: Config> RollbackSession<T> {
    /// Creates an unstarted session. Use [`SessionBuilder`](crate::SessionBuilder)
    /// to get a validated config.
    pub(crate) fn new(config: SessionConfig) -> Self {
        let num_players = config.num_players;
        Self {
            state: SessionState::Uninitialized,
            local_handle: None,
            input_delay: config.input_delay,
            prediction_window: config.prediction_window,
            socket: None,
            players: BTreeMap::new(),
            spectators: BTreeMap::new(),
            sync_layer: SyncLayer::new(num_players, config.prediction_window),
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            local_input_frame: Frame::NULL,
            pending_disconnect_frame: Frame::NULL,
            next_spectator_frame: Frame::new(0),
            local_checksums: BTreeMap::new(),
            last_sent_checksum_frame: Frame::NULL,
            frame_pacer: FramePacer::new(config.fps, config.frame_wait_spread),
            events: VecDeque::new(),
            config,
        }
    }

    /// Registers the roster and starts the handshake with every remote peer.
    ///
    /// `roster` lists every handle of the session, including the local one as
    /// [`PlayerType::Local`]. When `local_handle` is a spectator handle only
    /// player 1 is contacted and every other entry is ignored.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::InvalidRequest`] if the session is already started or
    ///   `input_delay`/`prediction_window` are out of range.
    /// - [`NetplayError::InvalidSession`] for a malformed roster: a missing or
    ///   mismatched local entry, duplicate handles or addresses, a missing
    ///   player, or a spectator roster without a player 1 to host it.
    pub fn start<S>(
        &mut self,
        local_handle: PlayerHandle,
        socket: S,
        roster: &[(PlayerHandle, PlayerType<T::Address>)],
        input_delay: usize,
        prediction_window: usize,
    ) -> Result<(), NetplayError>
    where
        S: NonBlockingSocket<T::Address> + 'static,
    {
        if !matches!(
            self.state,
            SessionState::Uninitialized | SessionState::Closed
        ) {
            return Err(NetplayError::InvalidRequest {
                info: format!("Cannot start a session in state {:?}", self.state),
            });
        }
        SessionConfig {
            input_delay,
            prediction_window,
            ..self.config.clone()
        }
        .validate()?;

        let (players, spectators) = self.validate_roster(local_handle, roster)?;

        self.state = SessionState::Initializing;
        self.reset(prediction_window, input_delay);
        self.local_handle = Some(local_handle);
        if let Some(slot) = self.local_slot() {
            self.sync_layer.set_frame_delay(slot, input_delay)?;
        }

        for (handles, addr) in players {
            let endpoint = self.create_endpoint(handles, addr.clone());
            self.players.insert(addr, endpoint);
        }
        for (handles, addr) in spectators {
            let endpoint = self.create_endpoint(handles, addr.clone());
            self.spectators.insert(addr, endpoint);
        }
        for endpoint in self.players.values_mut().chain(self.spectators.values_mut()) {
            endpoint.synchronize()?;
        }
        self.socket = Some(Box::new(socket));

        info!(
            local = %local_handle,
            players = self.players.len(),
            spectators = self.spectators.len(),
            input_delay,
            prediction_window,
            "session started"
        );
        if self.players.is_empty() && self.spectators.is_empty() {
            self.state = SessionState::Running;
            self.push_event(NetplayEvent::Running);
        } else {
            self.state = SessionState::Synchronizing;
            self.flush();
        }
        Ok(())
    }

    fn validate_roster(
        &self,
        local_handle: PlayerHandle,
        roster: &[(PlayerHandle, PlayerType<T::Address>)],
    ) -> Result<Endpoints<T::Address>, NetplayError> {
        let num_players = self.config.num_players;
        let mut seen = BTreeSet::new();
        for (handle, _) in roster {
            if handle.as_u16() == 0 {
                return Err(invalid_session("handle 0 is not a roster slot"));
            }
            if !seen.insert(*handle) {
                return Err(invalid_session(format!("handle {handle} appears twice")));
            }
        }
        let locals: Vec<PlayerHandle> = roster
            .iter()
            .filter(|(_, player_type)| *player_type == PlayerType::Local)
            .map(|(handle, _)| *handle)
            .collect();
        if locals != [local_handle] {
            return Err(invalid_session(format!(
                "expected exactly one local entry with handle {local_handle}, found {locals:?}"
            )));
        }

        if local_handle.is_spectator_for(num_players) {
            let host = roster.iter().find_map(|(handle, player_type)| match player_type {
                PlayerType::Remote(addr) if *handle == PlayerHandle::HOST => Some(addr.clone()),
                _ => None,
            });
            let Some(host) = host else {
                return Err(invalid_session(
                    "spectator roster has no remote player 1 to host it",
                ));
            };
            let handles = (0..num_players).map(PlayerHandle::from_slot).collect();
            return Ok((vec![(handles, host)], Vec::new()));
        }

        let mut players = Vec::new();
        let mut spectators = Vec::new();
        let mut addresses = BTreeSet::new();
        for (handle, player_type) in roster {
            match player_type {
                PlayerType::Local => {}
                PlayerType::Remote(addr) if handle.is_player_for(num_players) => {
                    if !addresses.insert(addr.clone()) {
                        return Err(invalid_session(format!("address {addr:?} registered twice")));
                    }
                    players.push((vec![*handle], addr.clone()));
                }
                PlayerType::Spectator(addr) if handle.is_spectator_for(num_players) => {
                    if local_handle != PlayerHandle::HOST {
                        return Err(invalid_session(format!(
                            "spectator {handle} can only be hosted by player 1"
                        )));
                    }
                    if !addresses.insert(addr.clone()) {
                        return Err(invalid_session(format!("address {addr:?} registered twice")));
                    }
                    spectators.push((vec![*handle], addr.clone()));
                }
                PlayerType::Remote(_) | PlayerType::Spectator(_) => {
                    return Err(invalid_session(format!(
                        "handle {handle} has the wrong role for {num_players} players"
                    )));
                }
            }
        }
        for slot in 0..num_players {
            let handle = PlayerHandle::from_slot(slot);
            if !seen.contains(&handle) {
                return Err(invalid_session(format!("player {handle} is missing")));
            }
        }
        Ok((players, spectators))
    }

    fn create_endpoint(&self, handles: Vec<PlayerHandle>, addr: T::Address) -> PeerEndpoint<T> {
        PeerEndpoint::new(
            handles,
            addr,
            self.config.num_players,
            self.config.disconnect_timeout,
            self.config.disconnect_notify_start,
            self.config.fps,
            self.config.desync_detection,
            self.config.time_sync,
            self.config.protocol,
        )
    }

    /// Adds the local input for the current frame and sends it to every remote
    /// player. Returns the frame the input was stored at, which is later than
    /// the current frame by the input delay.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::NotSynchronized`] unless the session is running.
    /// - [`NetplayError::PredictionExhausted`] when the simulation already runs
    ///   a full prediction window ahead of confirmed input. Idle this tick.
    /// - [`NetplayError::InvalidRequest`] when called twice for one frame or
    ///   while spectating.
    pub fn add_local_input(&mut self, input: T::Input) -> Result<Frame, NetplayError> {
        if self.state == SessionState::Spectating {
            return Err(NetplayError::InvalidRequest {
                info: "Spectators do not contribute input".to_owned(),
            });
        }
        if self.state != SessionState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        let Some(slot) = self.local_slot() else {
            return Err(NetplayError::NotSynchronized);
        };
        let frames_ahead = self.sync_layer.frames_ahead();
        if frames_ahead >= self.prediction_window as i32 {
            trace!(
                frames_ahead,
                window = self.prediction_window,
                "prediction window exhausted"
            );
            return Err(NetplayError::PredictionExhausted);
        }

        let frame = self.sync_layer.add_local_input(slot, input)?;
        self.local_input_frame = self.sync_layer.current_frame();
        if let Some(status) = self.local_connect_status.get_mut(slot) {
            status.last_frame = frame;
        }

        let row: InputRow<T::Input> = smallvec![input];
        for endpoint in self.players.values_mut() {
            endpoint.send_input(frame, row.clone(), &self.local_connect_status);
        }
        Ok(frame)
    }

    /// Returns the inputs for the current frame, rolling back and resimulating
    /// first if confirmed input contradicted a prediction.
    ///
    /// The snapshot of the state before frame 0 is taken on the first call.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::NotSynchronized`] before the handshake with every
    ///   remote peer completed.
    /// - [`NetplayError::PredictionExhausted`] if a rollback needed an evicted
    ///   snapshot, in which case the session is closed; while spectating it
    ///   only means the host's input for the frame has not arrived yet.
    /// - [`NetplayError::SimulationFailed`] if the simulation failed during the
    ///   rollback. The session is closed.
    pub fn synchronize_input(
        &mut self,
        sim: &mut impl Simulation<T>,
    ) -> Result<SynchronizedInputs<T::Input>, NetplayError> {
        if !matches!(
            self.state,
            SessionState::Running | SessionState::Spectating
        ) {
            return Err(NetplayError::NotSynchronized);
        }

        if self.sync_layer.snapshots().is_empty() {
            let saved = sim.save(Frame::NULL).map_err(NetplayError::from);
            let (state, checksum) = self.fatal_on_error(sim, saved)?;
            let displaced = self.sync_layer.save_snapshot(Frame::NULL, state, checksum);
            free_all::<T, _>(sim, displaced);
        }

        if self.state == SessionState::Spectating {
            return self.spectator_inputs();
        }

        self.apply_pending_rollback(sim)?;
        let frame = self.sync_layer.current_frame();
        let inputs = self.sync_layer.synchronized_inputs(&self.local_connect_status);
        inputs.ok_or_else(|| {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::FrameSync,
                "No inputs available for frame {}",
                frame
            );
            NetplayError::PredictionExhausted
        })
    }

    fn spectator_inputs(&self) -> Result<SynchronizedInputs<T::Input>, NetplayError> {
        let frame = self.sync_layer.current_frame();
        let inputs = self
            .sync_layer
            .confirmed_inputs(frame, &self.local_connect_status)
            .ok_or(NetplayError::PredictionExhausted)?;

        let mut statuses = Vec::with_capacity(inputs.len());
        let mut disconnect_flags = 0_u32;
        for slot in 0..inputs.len() {
            let status = self.local_connect_status.get(slot).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                statuses.push(InputStatus::Disconnected);
                disconnect_flags |= 1 << slot;
            } else {
                statuses.push(InputStatus::Confirmed);
            }
        }
        Ok(SynchronizedInputs {
            frame,
            inputs,
            statuses,
            disconnect_flags,
        })
    }

    fn apply_pending_rollback(&mut self, sim: &mut impl Simulation<T>) -> Result<(), NetplayError> {
        let current = self.sync_layer.current_frame();
        let first_incorrect = self
            .sync_layer
            .first_incorrect_frame()
            .min_known(self.pending_disconnect_frame);
        self.pending_disconnect_frame = Frame::NULL;

        if first_incorrect.is_null() {
            return Ok(());
        }
        if first_incorrect >= current {
            // the mispredicted frame was never simulated
            self.sync_layer.reset_prediction();
            return Ok(());
        }

        debug!(
            from = %first_incorrect,
            to = %current,
            "rolling back"
        );
        let loaded = match self.sync_layer.rewind_to(first_incorrect - 1) {
            Ok(snapshot) => sim
                .load(&snapshot.state, snapshot.frame)
                .map_err(NetplayError::from),
            Err(err) => Err(err),
        };
        self.fatal_on_error(sim, loaded)?;
        self.sync_layer.reset_prediction();

        sim.set_resimulating(true);
        let resimulated = self.resimulate(sim, current);
        sim.set_resimulating(false);
        self.fatal_on_error(sim, resimulated)
    }

    fn resimulate(&mut self, sim: &mut impl Simulation<T>, frontier: Frame) -> Result<(), NetplayError> {
        while self.sync_layer.current_frame() < frontier {
            let inputs = self
                .sync_layer
                .synchronized_inputs(&self.local_connect_status)
                .ok_or(NetplayError::PredictionExhausted)?;
            self.simulate_frame(sim, &inputs)?;
        }
        Ok(())
    }

    /// Advances the simulation by one frame with `inputs` from
    /// [`synchronize_input`](Self::synchronize_input), stores the snapshot and
    /// checksum, and evicts snapshots that left the prediction window.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::NotSynchronized`] unless running or spectating.
    /// - [`NetplayError::InvalidRequest`] if `inputs` belong to another frame.
    /// - [`NetplayError::SimulationFailed`] if the simulation failed. The
    ///   session is closed.
    pub fn advance_frame(
        &mut self,
        sim: &mut impl Simulation<T>,
        inputs: &SynchronizedInputs<T::Input>,
    ) -> Result<(), NetplayError> {
        if !matches!(
            self.state,
            SessionState::Running | SessionState::Spectating
        ) {
            return Err(NetplayError::NotSynchronized);
        }
        let current = self.sync_layer.current_frame();
        if inputs.frame != current {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "Inputs for frame {} cannot advance frame {}",
                    inputs.frame, current
                ),
            });
        }

        let simulated = self.simulate_frame(sim, inputs);
        self.fatal_on_error(sim, simulated)?;

        if self.state == SessionState::Spectating {
            self.sync_layer.set_last_confirmed_frame(current);
        } else {
            self.update_confirmed_frame();
            self.send_confirmed_inputs_to_spectators();
            self.exchange_checksums();
            self.check_time_sync(current);
        }

        let evicted = self.sync_layer.evict_snapshots();
        free_all::<T, _>(sim, evicted);
        Ok(())
    }

    fn simulate_frame(
        &mut self,
        sim: &mut impl Simulation<T>,
        inputs: &SynchronizedInputs<T::Input>,
    ) -> Result<(), NetplayError> {
        let frame = self.sync_layer.current_frame();
        sim.advance(&inputs.inputs, inputs.disconnect_flags)?;
        let (state, checksum) = sim.save(frame)?;
        let displaced = self.sync_layer.save_snapshot(frame, state, checksum);
        free_all::<T, _>(sim, displaced);

        if let DesyncDetection::On { interval } = self.config.desync_detection {
            if frame.as_i32() % interval as i32 == 0 {
                self.local_checksums.insert(frame, checksum);
            }
        }
        self.sync_layer.advance_frame();
        Ok(())
    }

    fn update_confirmed_frame(&mut self) {
        let current = self.sync_layer.current_frame();
        let mut confirmed = Frame::new(i32::MAX);
        let mut any_connected = false;
        for (slot, status) in self.local_connect_status.iter().enumerate() {
            if status.disconnected {
                continue;
            }
            any_connected = true;
            confirmed = confirmed.min(self.sync_layer.last_added_frame(slot));
        }
        if !any_connected {
            confirmed = current - 1;
        }
        if !self.pending_disconnect_frame.is_null() {
            confirmed = confirmed.min(self.pending_disconnect_frame - 1);
        }
        self.sync_layer.set_last_confirmed_frame(confirmed);
    }

    fn send_confirmed_inputs_to_spectators(&mut self) {
        if self.spectators.is_empty() {
            return;
        }
        let confirmed = self.sync_layer.last_confirmed_frame();
        while self.next_spectator_frame <= confirmed {
            let frame = self.next_spectator_frame;
            let Some(inputs) = self
                .sync_layer
                .confirmed_inputs(frame, &self.local_connect_status)
            else {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::FrameSync,
                    "Confirmed inputs for frame {} are not available for spectators",
                    frame
                );
                return;
            };
            let row: InputRow<T::Input> = inputs.into_iter().collect();
            for endpoint in self.spectators.values_mut() {
                endpoint.send_input(frame, row.clone(), &self.local_connect_status);
            }
            self.next_spectator_frame += 1;
        }
    }

    fn exchange_checksums(&mut self) {
        if let DesyncDetection::Off = self.config.desync_detection {
            return;
        }
        let confirmed = self.sync_layer.last_confirmed_frame();
        if confirmed.is_null() {
            return;
        }

        let first_unsent = self.last_sent_checksum_frame + 1;
        let unsent: Vec<(Frame, u128)> = if first_unsent <= confirmed {
            self.local_checksums
                .range(first_unsent..=confirmed)
                .map(|(frame, checksum)| (*frame, *checksum))
                .collect()
        } else {
            Vec::new()
        };
        for (frame, checksum) in unsent {
            for endpoint in self.players.values_mut().filter(|ep| ep.is_running()) {
                endpoint.send_checksum_report(frame, checksum);
            }
            self.last_sent_checksum_frame = frame;
        }

        let mut mismatches = Vec::new();
        for endpoint in self.players.values_mut() {
            let handle = endpoint.handles().first().copied().unwrap_or_default();
            for (frame, remote_checksum) in endpoint.take_checksums_through(confirmed) {
                match self.local_checksums.get(&frame) {
                    Some(&local_checksum) if local_checksum != remote_checksum => {
                        mismatches.push(NetplayEvent::DesyncDetected {
                            frame,
                            local_checksum,
                            remote_checksum,
                            handle,
                        });
                    }
                    Some(_) => trace!(%frame, %handle, "checksums match"),
                    None => trace!(%frame, "no local checksum to compare"),
                }
            }
        }
        for event in mismatches {
            warn!(?event, "desync detected");
            self.push_event(event);
        }

        while self.local_checksums.len() > self.config.protocol.max_checksum_history {
            self.local_checksums.pop_first();
        }
    }

    fn check_time_sync(&mut self, frame: Frame) {
        let interval = self.config.time_sync.event_interval.max(1) as i32;
        if frame.as_i32() % interval != 0 {
            return;
        }
        let frames_ahead = self
            .players
            .values()
            .filter(|ep| ep.is_running())
            .map(PeerEndpoint::frames_ahead)
            .reduce(f32::max);
        if let Some(frames_ahead) = frames_ahead {
            self.frame_pacer.on_time_sync_event(frames_ahead);
            self.push_event(NetplayEvent::TimeSync { frames_ahead });
        }
    }

    /// Receives pending messages, applies them, drives handshakes, keepalives
    /// and disconnect timers, and sends everything queued.
    pub fn poll_remote_clients(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        for (from, msg) in socket.receive_all_messages() {
            if let Some(endpoint) = self.players.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else if let Some(endpoint) = self.spectators.get_mut(&from) {
                endpoint.handle_message(&msg);
            } else {
                trace!(?from, "dropping message from unknown address");
            }
        }

        let current = self.sync_layer.current_frame();
        for endpoint in self.players.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current);
            }
        }

        let mut events = Vec::new();
        for endpoint in self.players.values_mut().chain(self.spectators.values_mut()) {
            let handles = endpoint.handles().to_vec();
            let addr = endpoint.peer_addr().clone();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push((handles.clone(), addr.clone(), event));
            }
        }
        for (handles, addr, event) in events {
            self.handle_event(&handles, &addr, event);
        }

        if self.is_spectator() {
            self.refresh_host_connect_status();
        } else {
            self.update_player_disconnects();
            if self.state == SessionState::Running {
                self.update_confirmed_frame();
            }
        }
        self.check_initial_sync();
        self.flush();
    }

    /// Polls the network without advancing the simulation. Handshakes are
    /// retried and keepalives sent as usual.
    pub fn run_idle(&mut self) {
        self.poll_remote_clients();
    }

    fn handle_event(&mut self, handles: &[PlayerHandle], addr: &T::Address, event: Event<T::Input>) {
        let handle = handles.first().copied().unwrap_or_default();
        match event {
            Event::Synchronizing { total, count } => {
                self.push_event(NetplayEvent::Synchronizing {
                    handle,
                    total,
                    count,
                });
            }
            Event::Synchronized => {
                debug!(%handle, "peer synchronized");
                self.push_event(NetplayEvent::Synchronized { handle });
            }
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(NetplayEvent::NetworkInterrupted {
                    handle,
                    disconnect_timeout,
                });
            }
            Event::NetworkResumed => self.push_event(NetplayEvent::NetworkResumed { handle }),
            Event::Chat { text } => self.push_event(NetplayEvent::ChatMessage { handle, text }),
            Event::Disconnected => {
                if let Some(endpoint) = self.spectators.get_mut(addr) {
                    endpoint.disconnect();
                    info!(%handle, "spectator disconnected");
                    self.push_event(NetplayEvent::Disconnected { handle });
                } else if self.is_spectator() {
                    if let Some(endpoint) = self.players.get_mut(addr) {
                        endpoint.disconnect();
                    }
                    info!("host disconnected");
                    self.push_event(NetplayEvent::Disconnected { handle });
                } else {
                    for &player in handles {
                        let last_frame = player
                            .input_slot()
                            .and_then(|slot| self.local_connect_status.get(slot))
                            .map_or(Frame::NULL, |status| status.last_frame);
                        self.disconnect_player(player, last_frame);
                    }
                }
            }
            Event::Input { frame, row } => self.add_remote_row(handles, frame, &row),
        }
    }

    fn add_remote_row(&mut self, handles: &[PlayerHandle], frame: Frame, row: &[T::Input]) {
        let spectating = self.is_spectator();
        for (handle, input) in handles.iter().zip(row.iter()) {
            let Some(slot) = handle
                .input_slot()
                .filter(|_| handle.is_player_for(self.config.num_players))
            else {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Received input for non-player handle {}",
                    handle
                );
                continue;
            };
            if !spectating
                && self
                    .local_connect_status
                    .get(slot)
                    .is_some_and(|status| status.disconnected)
            {
                continue;
            }
            match self
                .sync_layer
                .add_remote_input(slot, PlayerInput::new(frame, *input))
            {
                Ok(added) if !added.is_null() => {
                    if !spectating {
                        if let Some(status) = self.local_connect_status.get_mut(slot) {
                            status.last_frame = added;
                        }
                    }
                }
                Ok(_) => trace!(%frame, %handle, "ignoring duplicate remote input"),
                Err(err) => report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "Failed to add remote input for handle {}: {}",
                    handle,
                    err
                ),
            }
        }
    }

    /// Marks `handle` as disconnected after `last_frame`. Inputs past that
    /// frame are replaced by the default input, resimulating if needed.
    fn disconnect_player(&mut self, handle: PlayerHandle, last_frame: Frame) {
        let Some(status) = handle
            .input_slot()
            .and_then(|slot| self.local_connect_status.get_mut(slot))
        else {
            return;
        };
        let newly_disconnected = !status.disconnected;
        if !newly_disconnected && status.last_frame <= last_frame {
            return;
        }
        status.disconnected = true;
        status.last_frame = if newly_disconnected {
            last_frame
        } else {
            status.last_frame.min(last_frame)
        };
        let cutoff = status.last_frame + 1;

        if cutoff < self.sync_layer.current_frame() {
            self.pending_disconnect_frame = self.pending_disconnect_frame.min_known(cutoff);
        }
        if let Some(endpoint) = self
            .players
            .values_mut()
            .find(|ep| ep.handles().contains(&handle))
        {
            endpoint.disconnect();
        }
        if newly_disconnected {
            info!(%handle, %last_frame, "player disconnected");
            self.push_event(NetplayEvent::Disconnected { handle });
        }
    }

    /// Adopts disconnects other peers observed before we did.
    fn update_player_disconnects(&mut self) {
        let local_slot = self.local_slot();
        for slot in 0..self.config.num_players {
            if Some(slot) == local_slot {
                continue;
            }
            let reported = self
                .players
                .values()
                .filter(|ep| ep.is_running())
                .map(|ep| ep.peer_connect_status(slot))
                .filter(|status| status.disconnected)
                .map(|status| status.last_frame)
                .min();
            let Some(reported) = reported else {
                continue;
            };
            let local = self
                .local_connect_status
                .get(slot)
                .copied()
                .unwrap_or_default();
            let last_frame = if local.last_frame.is_null() {
                reported
            } else {
                reported.min(local.last_frame)
            };
            if !local.disconnected || local.last_frame > last_frame {
                self.disconnect_player(PlayerHandle::from_slot(slot), last_frame);
            }
        }
    }

    fn refresh_host_connect_status(&mut self) {
        if let Some(host) = self.players.values().next() {
            for (slot, status) in self.local_connect_status.iter_mut().enumerate() {
                *status = host.peer_connect_status(slot);
            }
        }
    }

    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        let all_synchronized = self
            .players
            .values()
            .chain(self.spectators.values())
            .all(PeerEndpoint::is_synchronized);
        if !all_synchronized {
            return;
        }
        self.state = if self.is_spectator() {
            SessionState::Spectating
        } else {
            SessionState::Running
        };
        info!(state = ?self.state, "all peers synchronized");
        self.push_event(NetplayEvent::Running);
    }

    /// One iteration of the simulation loop: polls the network, adds
    /// `local_input` once per frame, synchronizes and advances the simulation.
    /// Returns how long the caller should wait before the next tick.
    ///
    /// Backpressure and an unfinished handshake make the tick idle instead of
    /// failing. A spectator advances on confirmed host input only, and catches
    /// up with two frames per tick when far behind.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::NotSynchronized`] if the session was never started or is closed.
    /// - Fatal errors of [`synchronize_input`](Self::synchronize_input) and
    ///   [`advance_frame`](Self::advance_frame). The session is closed.
    pub fn tick(
        &mut self,
        sim: &mut impl Simulation<T>,
        local_input: T::Input,
    ) -> Result<Duration, NetplayError> {
        self.poll_remote_clients();
        match self.state {
            SessionState::Running => match self.step(sim, local_input) {
                Ok(()) | Err(NetplayError::NotSynchronized) => {}
                Err(NetplayError::PredictionExhausted) if self.state != SessionState::Closed => {
                    trace!("prediction window exhausted, idling");
                }
                Err(err) => return Err(err),
            },
            SessionState::Spectating => {
                let backlog = self.sync_layer.last_added_frame(0) - self.sync_layer.current_frame();
                let steps = if backlog > SPECTATOR_CATCHUP_THRESHOLD { 2 } else { 1 };
                for _ in 0..steps {
                    match self.spectate_step(sim) {
                        Ok(()) => {}
                        Err(NetplayError::PredictionExhausted) => break,
                        Err(err) => return Err(err),
                    }
                }
            }
            SessionState::Synchronizing => {}
            SessionState::Uninitialized | SessionState::Initializing | SessionState::Closed => {
                return Err(NetplayError::NotSynchronized);
            }
        }
        self.flush();
        let wait = u64::try_from(self.frame_pacer.wait_this_loop()).unwrap_or(0);
        Ok(Duration::from_micros(wait))
    }

    fn step(&mut self, sim: &mut impl Simulation<T>, local_input: T::Input) -> Result<(), NetplayError> {
        if self.local_input_frame != self.sync_layer.current_frame() {
            match self.add_local_input(local_input) {
                Err(NetplayError::PredictionExhausted) if self.state == SessionState::Running => {
                    // a pending rollback can hold the confirmed frame back
                    self.apply_pending_rollback(sim)?;
                    self.update_confirmed_frame();
                    self.add_local_input(local_input)?;
                }
                added => {
                    added?;
                }
            }
        }
        let inputs = self.synchronize_input(sim)?;
        self.advance_frame(sim, &inputs)
    }

    fn spectate_step(&mut self, sim: &mut impl Simulation<T>) -> Result<(), NetplayError> {
        let inputs = self.synchronize_input(sim)?;
        self.advance_frame(sim, &inputs)
    }

    /// Sends `"<nickname>: <text>"` to every peer and returns the rendered line.
    ///
    /// # Errors
    ///
    /// [`NetplayError::NotSynchronized`] if the session is not started.
    pub fn send_chat_message(&mut self, text: &str) -> Result<String, NetplayError> {
        if !matches!(
            self.state,
            SessionState::Synchronizing | SessionState::Running | SessionState::Spectating
        ) {
            return Err(NetplayError::NotSynchronized);
        }
        let line = format!("{}: {}", self.config.nickname, text);
        for endpoint in self.players.values_mut().chain(self.spectators.values_mut()) {
            endpoint.send_chat(&line);
        }
        self.flush();
        Ok(line)
    }

    /// Connection quality towards the peer behind `handle`.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::InvalidRequest`] for the local handle or a handle not in the roster.
    /// - [`NetplayError::PeerTimeout`] if the peer was disconnected.
    /// - [`NetplayError::NotSynchronized`] before the handshake started.
    pub fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, NetplayError> {
        if Some(handle) == self.local_handle {
            return Err(NetplayError::InvalidRequest {
                info: "The local handle has no network stats".to_owned(),
            });
        }
        let Some(endpoint) = self
            .players
            .values()
            .chain(self.spectators.values())
            .find(|ep| ep.handles().contains(&handle))
        else {
            return Err(NetplayError::InvalidRequest {
                info: format!("Handle {handle} is not a remote roster entry"),
            });
        };
        let disconnected = !self.is_spectator()
            && handle
                .input_slot()
                .and_then(|slot| self.local_connect_status.get(slot))
                .is_some_and(|status| status.disconnected);
        if disconnected
            || matches!(
                endpoint.state(),
                ProtocolState::Disconnected | ProtocolState::Shutdown
            )
        {
            return Err(NetplayError::PeerTimeout { handle });
        }
        endpoint.network_stats()
    }

    /// Round trip time in milliseconds to the other player: player 2 when we
    /// are player 1, player 1 otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`network_stats`](Self::network_stats).
    pub fn ping(&self) -> Result<u128, NetplayError> {
        let Some(local) = self.local_handle else {
            return Err(NetplayError::NotSynchronized);
        };
        let other = if local == PlayerHandle::HOST {
            PlayerHandle::new(2)
        } else {
            PlayerHandle::HOST
        };
        self.network_stats(other).map(|stats| stats.ping)
    }

    /// Tears the session down: peers, socket and snapshots are dropped and the
    /// local handle, input delay and prediction window return to their
    /// configured defaults. Calling it again has no further effect.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was = self.state;
        self.socket = None;
        self.local_handle = None;
        self.reset(self.config.prediction_window, self.config.input_delay);
        self.state = SessionState::Closed;
        info!(from = ?was, "session closed");
    }

    /// The frame that will be simulated next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The newest frame whose inputs are confirmed for every connected player.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// Frames simulated past the confirmed frame.
    #[must_use]
    pub fn frames_ahead(&self) -> i32 {
        self.sync_layer.frames_ahead()
    }

    /// The lifecycle state.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The local handle while started.
    #[must_use]
    pub fn local_handle(&self) -> Option<PlayerHandle> {
        self.local_handle
    }

    /// The active prediction window.
    #[must_use]
    pub fn prediction_window(&self) -> usize {
        self.prediction_window
    }

    /// The active local input delay.
    #[must_use]
    pub fn input_delay(&self) -> usize {
        self.input_delay
    }

    /// The configuration the session was built with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The pacer fed by this session's time-sync events.
    #[must_use]
    pub fn frame_pacer(&self) -> &FramePacer {
        &self.frame_pacer
    }

    /// Drains the pending events.
    pub fn events(&mut self) -> Drain<'_, NetplayEvent> {
        self.events.drain(..)
    }

    fn is_spectator(&self) -> bool {
        self.local_handle
            .is_some_and(|handle| handle.is_spectator_for(self.config.num_players))
    }

    fn local_slot(&self) -> Option<usize> {
        self.local_handle
            .filter(|handle| handle.is_player_for(self.config.num_players))
            .and_then(PlayerHandle::input_slot)
    }

    fn push_event(&mut self, event: NetplayEvent) {
        self.events.push_back(event);
        while self.events.len() > MAX_EVENT_QUEUE_SIZE {
            self.events.pop_front();
        }
    }

    fn flush(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        for endpoint in self.players.values_mut().chain(self.spectators.values_mut()) {
            endpoint.send_all_messages(socket.as_mut());
        }
    }

    fn reset(&mut self, prediction_window: usize, input_delay: usize) {
        self.prediction_window = prediction_window;
        self.input_delay = input_delay;
        self.players.clear();
        self.spectators.clear();
        self.sync_layer = SyncLayer::new(self.config.num_players, prediction_window);
        self.local_connect_status = vec![ConnectionStatus::default(); self.config.num_players];
        self.local_input_frame = Frame::NULL;
        self.pending_disconnect_frame = Frame::NULL;
        self.next_spectator_frame = Frame::new(0);
        self.local_checksums.clear();
        self.last_sent_checksum_frame = Frame::NULL;
        self.frame_pacer = FramePacer::new(self.config.fps, self.config.frame_wait_spread);
    }

    /// Closes the session when `result` is an error. Determinism cannot be
    /// guaranteed after a failed load, save or advance.
    fn fatal_on_error<V>(
        &mut self,
        sim: &mut impl Simulation<T>,
        result: Result<V, NetplayError>,
    ) -> Result<V, NetplayError> {
        if let Err(err) = &result {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "Closing session at frame {}: {}",
                self.sync_layer.current_frame(),
                err
            );
            free_all::<T, _>(sim, self.sync_layer.clear());
            self.close();
        }
        result
    }
}

impl<T> RollbackSession<T>
where
    T: Config<Address = SocketAddr>,
{
    /// Binds a [`ThreadedUdpSocket`] on `local_port` and starts with it.
    ///
    /// # Errors
    ///
    /// [`NetplayError::SocketError`] if the port cannot be bound, otherwise as
    /// [`start`](Self::start).
    pub fn start_udp(
        &mut self,
        local_handle: PlayerHandle,
        local_port: u16,
        roster: &[(PlayerHandle, PlayerType<SocketAddr>)],
        input_delay: usize,
        prediction_window: usize,
    ) -> Result<(), NetplayError> {
        let socket =
            ThreadedUdpSocket::bind_to_port(local_port).map_err(|e| NetplayError::SocketError {
                context: format!("failed to bind UDP port {local_port}: {e}"),
            })?;
        self.start(local_handle, socket, roster, input_delay, prediction_window)
    }

    /// Starts from the roster of a completed
    /// [`TraversalClient`](crate::TraversalClient) exchange. The first
    /// participant is the local one; its nickname becomes ours.
    ///
    /// A spectator connects to player 1 only. A player registers every other
    /// player, and player 1 additionally hosts every spectator.
    ///
    /// # Errors
    ///
    /// - [`NetplayError::InvalidSession`] for an empty roster, an address that
    ///   does not resolve or a spectator roster without player 1.
    /// - Otherwise as [`start_udp`](Self::start_udp).
    pub fn start_traversal(
        &mut self,
        participants: &[Participant],
        input_delay: usize,
        prediction_window: usize,
    ) -> Result<(), NetplayError> {
        let Some((local, remotes)) = participants.split_first() else {
            return Err(invalid_session("traversal roster is empty"));
        };
        let num_players = self.config.num_players;
        let local_handle = local.handle;
        let mut roster = vec![(local_handle, PlayerType::Local)];

        if local_handle.is_spectator_for(num_players) {
            let Some(host) = remotes.iter().find(|p| p.handle == PlayerHandle::HOST) else {
                return Err(invalid_session(
                    "spectator roster has no player 1 to host it",
                ));
            };
            roster.push((PlayerHandle::HOST, PlayerType::Remote(resolve(host)?)));
        } else {
            for participant in remotes {
                if participant.handle.is_player_for(num_players) {
                    roster.push((participant.handle, PlayerType::Remote(resolve(participant)?)));
                } else if local_handle == PlayerHandle::HOST {
                    roster.push((
                        participant.handle,
                        PlayerType::Spectator(resolve(participant)?),
                    ));
                }
            }
        }

        debug!(participants = participants.len(), "starting from traversal roster");
        self.config.nickname.clone_from(&local.nickname);
        self.start_udp(local_handle, local.port, &roster, input_delay, prediction_window)
    }
}

type Endpoints<A> = (Vec<(Vec<PlayerHandle>, A)>, Vec<(Vec<PlayerHandle>, A)>);

fn resolve(participant: &Participant) -> Result<SocketAddr, NetplayError> {
    let addrs: Vec<SocketAddr> = (participant.address.as_str(), participant.port)
        .to_socket_addrs()
        .map_err(|e| invalid_session(format!("cannot resolve {participant}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| invalid_session(format!("no address for {participant}")))
}

fn invalid_session(info: impl Into<String>) -> NetplayError {
    NetplayError::InvalidSession { info: info.into() }
}

fn free_all<T: Config, S: Simulation<T> + ?Sized>(sim: &mut S, states: Vec<T::State>) {
    for state in states {
        sim.free(state);
    }
}
