//! Shared test infrastructure: a scripted simulation, an in-memory lossy-free
//! network with configurable jitter and duplication, and helpers to wire up
//! sessions on top of it.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rollback_netplay::{
    Config, Frame, Message, NetplayError, NonBlockingSocket, PlayerHandle, PlayerType,
    RollbackSession, SessionBuilder, Simulation, SimulationError,
};
use serde::{Deserialize, Serialize};
use web_time::Duration;

/// Routes session logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct StubInput(pub u8);

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type State = u64;
    type Address = SocketAddr;
}

/// Folds one frame of inputs into the running value.
pub fn step(value: u64, inputs: &[StubInput]) -> u64 {
    inputs.iter().fold(value, |acc, input| {
        acc.wrapping_mul(31)
            .wrapping_add(u64::from(input.0))
            .wrapping_add(1)
    })
}

/// A simulation whose state is a single hash chained over every input row.
///
/// `history` holds the value after each simulated frame and is overwritten
/// when a frame is resimulated, so after the session confirms a frame its
/// entry must match an uninterrupted run over the true inputs.
#[derive(Debug, Default)]
pub struct StubSimulation {
    pub value: u64,
    pub history: BTreeMap<i32, u64>,
    pub last_flags: u32,
    pub loads: usize,
    pub resimulated_frames: usize,
    pub freed: usize,
    pub resimulating: bool,
    /// Mixed into reported checksums to fake a desync.
    pub checksum_salt: u64,
}

impl Simulation<StubConfig> for StubSimulation {
    fn advance(&mut self, inputs: &[StubInput], disconnect_flags: u32) -> Result<(), SimulationError> {
        self.value = step(self.value, inputs);
        self.last_flags = disconnect_flags;
        if self.resimulating {
            self.resimulated_frames += 1;
        }
        Ok(())
    }

    fn save(&mut self, frame: Frame) -> Result<(u64, u128), SimulationError> {
        if frame.is_valid() {
            self.history.insert(frame.as_i32(), self.value);
        }
        Ok((self.value, u128::from(self.value ^ self.checksum_salt)))
    }

    fn load(&mut self, state: &u64, _frame: Frame) -> Result<(), SimulationError> {
        self.value = *state;
        self.loads += 1;
        Ok(())
    }

    fn free(&mut self, _state: u64) {
        self.freed += 1;
    }

    fn set_resimulating(&mut self, resimulating: bool) {
        self.resimulating = resimulating;
    }
}

/// Deterministic pseudo-random input of `handle` at `frame`. Changes often
/// enough that most predictions are wrong.
pub fn scripted_input(seed: u64, handle: PlayerHandle, frame: i32) -> StubInput {
    let mut x = seed
        ^ u64::from(handle.as_u16()).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (frame as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 31;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 29;
    StubInput((x % 7) as u8)
}

/// The value after every frame in `0..frames` of an uninterrupted run, with
/// each player's input shifted by its input delay.
pub fn reference_history(seed: u64, delays: &[usize], frames: i32) -> Vec<u64> {
    let mut value = 0;
    let mut history = Vec::with_capacity(frames.max(0) as usize);
    for frame in 0..frames {
        let row: Vec<StubInput> = delays
            .iter()
            .enumerate()
            .map(|(slot, &delay)| {
                let delay = delay as i32;
                if frame < delay {
                    StubInput::default()
                } else {
                    scripted_input(seed, PlayerHandle::from_slot(slot), frame - delay)
                }
            })
            .collect();
        value = step(value, &row);
        history.push(value);
    }
    history
}

// ============================================================================
// In-memory network
// ============================================================================

struct Packet {
    deliver_at: u64,
    from: SocketAddr,
    to: SocketAddr,
    msg: Message,
}

#[derive(Default)]
struct NetworkState {
    now: u64,
    in_flight: Vec<Packet>,
    delays: Vec<u64>,
    sent: usize,
    duplicate: bool,
    blocked: BTreeSet<SocketAddr>,
}

/// A shared medium the [`MemorySocket`]s send through. Time is measured in
/// [`advance`](Self::advance) calls, one per test loop iteration.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packet `n` is delivered `delays[n % delays.len()]` ticks after it was sent,
    /// which reorders packets whenever the delays are uneven.
    pub fn with_jitter(delays: Vec<u64>) -> Self {
        let network = Self::default();
        network.state.lock().delays = delays;
        network
    }

    /// Every packet is delivered a second time one tick later.
    pub fn with_duplicates(self) -> Self {
        self.state.lock().duplicate = true;
        self
    }

    pub fn socket(&self, addr: SocketAddr) -> MemorySocket {
        MemorySocket {
            addr,
            network: self.clone(),
        }
    }

    pub fn advance(&self) {
        self.state.lock().now += 1;
    }

    /// A blocked address neither sends nor receives anything.
    pub fn set_blocked(&self, addr: SocketAddr, blocked: bool) {
        let mut state = self.state.lock();
        if blocked {
            state.blocked.insert(addr);
        } else {
            state.blocked.remove(&addr);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
}

impl NonBlockingSocket<SocketAddr> for MemorySocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let mut state = self.network.state.lock();
        if state.blocked.contains(&self.addr) || state.blocked.contains(addr) {
            return;
        }
        let delay = if state.delays.is_empty() {
            0
        } else {
            state.delays[state.sent % state.delays.len()]
        };
        state.sent += 1;
        let deliver_at = state.now + delay;
        if state.duplicate {
            state.in_flight.push(Packet {
                deliver_at: deliver_at + 1,
                from: self.addr,
                to: *addr,
                msg: msg.clone(),
            });
        }
        state.in_flight.push(Packet {
            deliver_at,
            from: self.addr,
            to: *addr,
            msg: msg.clone(),
        });
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut state = self.network.state.lock();
        let now = state.now;
        let blocked = state.blocked.contains(&self.addr);
        let (arrived, pending): (Vec<Packet>, Vec<Packet>) = std::mem::take(&mut state.in_flight)
            .into_iter()
            .partition(|p| p.to == self.addr && p.deliver_at <= now);
        state.in_flight = pending;
        if blocked {
            return Vec::new();
        }
        arrived.into_iter().map(|p| (p.from, p.msg)).collect()
    }
}

// ============================================================================
// Peers
// ============================================================================

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// One session with its simulation and scripted input source.
pub struct Peer {
    pub handle: PlayerHandle,
    pub addr: SocketAddr,
    pub session: RollbackSession<StubConfig>,
    pub sim: StubSimulation,
    pub seed: u64,
}

impl Peer {
    pub fn new(
        builder: SessionBuilder<StubConfig>,
        handle: PlayerHandle,
        addr: SocketAddr,
        seed: u64,
    ) -> Self {
        Self {
            handle,
            addr,
            session: builder.build().unwrap(),
            sim: StubSimulation::default(),
            seed,
        }
    }

    pub fn start(
        &mut self,
        network: &MemoryNetwork,
        roster: &[(PlayerHandle, PlayerType<SocketAddr>)],
        input_delay: usize,
        prediction_window: usize,
    ) -> Result<(), NetplayError> {
        self.session.start(
            self.handle,
            network.socket(self.addr),
            roster,
            input_delay,
            prediction_window,
        )
    }

    /// One loop iteration with the scripted input for the current frame.
    pub fn tick(&mut self) -> Result<Duration, NetplayError> {
        let frame = self.session.current_frame().as_i32();
        let input = scripted_input(self.seed, self.handle, frame);
        self.session.tick(&mut self.sim, input)
    }
}

/// Roster of a two player match as seen by `local`.
pub fn two_player_roster(
    local: PlayerHandle,
    other: SocketAddr,
) -> Vec<(PlayerHandle, PlayerType<SocketAddr>)> {
    let other_handle = if local == PlayerHandle::HOST {
        PlayerHandle::new(2)
    } else {
        PlayerHandle::HOST
    };
    vec![(local, PlayerType::Local), (other_handle, PlayerType::Remote(other))]
}

/// Two started players on `network`, player 1 on port 7001 and player 2 on 7002.
pub fn start_pair(
    network: &MemoryNetwork,
    seed: u64,
    delays: [usize; 2],
    prediction_window: usize,
) -> (Peer, Peer) {
    let mut a = Peer::new(SessionBuilder::new(), PlayerHandle::HOST, addr(7001), seed);
    let mut b = Peer::new(SessionBuilder::new(), PlayerHandle::new(2), addr(7002), seed);
    a.start(network, &two_player_roster(a.handle, b.addr), delays[0], prediction_window)
        .unwrap();
    b.start(network, &two_player_roster(b.handle, a.addr), delays[1], prediction_window)
        .unwrap();
    (a, b)
}

/// Polls both peers without advancing until neither is synchronizing.
pub fn synchronize(network: &MemoryNetwork, peers: &mut [&mut Peer]) {
    for _ in 0..1000 {
        network.advance();
        for peer in peers.iter_mut() {
            peer.session.run_idle();
        }
        if peers.iter().all(|peer| {
            !matches!(
                peer.session.current_state(),
                rollback_netplay::SessionState::Synchronizing
            )
        }) {
            return;
        }
    }
    panic!("peers did not synchronize");
}
