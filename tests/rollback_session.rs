//! Rollback session integration tests over an in-memory network.

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

mod common;

use common::{
    addr, init_tracing, reference_history, scripted_input, start_pair, synchronize,
    two_player_roster, MemoryNetwork, Peer, StubConfig, StubInput,
};
use proptest::prelude::*;
use rollback_netplay::__internal::{PlayerInput, SyncLayer};
use rollback_netplay::{
    DesyncDetection, Frame, NetplayError, NetplayEvent, Participant, PlayerHandle, PlayerType,
    SessionBuilder, SessionState,
};
use serial_test::serial;
use web_time::{Duration, Instant};

const FRAMES: i32 = 40;

/// Ticks both peers until each has confirmed every frame below `frames`.
fn run_until_confirmed(network: &MemoryNetwork, a: &mut Peer, b: &mut Peer, frames: i32) {
    for _ in 0..5000 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
        if a.session.confirmed_frame() >= Frame::new(frames - 1)
            && b.session.confirmed_frame() >= Frame::new(frames - 1)
        {
            return;
        }
    }
    panic!(
        "frames were not confirmed: a at {} (confirmed {}), b at {} (confirmed {})",
        a.session.current_frame(),
        a.session.confirmed_frame(),
        b.session.current_frame(),
        b.session.confirmed_frame()
    );
}

fn assert_history(peer: &Peer, reference: &[u64]) {
    for (frame, expected) in reference.iter().enumerate() {
        assert_eq!(
            peer.sim.history.get(&(frame as i32)),
            Some(expected),
            "handle {} diverged at frame {frame}",
            peer.handle
        );
    }
}

fn drain(peer: &mut Peer) -> Vec<NetplayEvent> {
    peer.session.events().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn rollback_matches_uninterrupted_run(
        seed in any::<u64>(),
        jitter in prop::collection::vec(0_u64..4, 1..5),
        delay_a in 0_usize..3,
        delay_b in 0_usize..3,
    ) {
        let network = MemoryNetwork::with_jitter(jitter);
        let (mut a, mut b) = start_pair(&network, seed, [delay_a, delay_b], 8);
        run_until_confirmed(&network, &mut a, &mut b, FRAMES);

        let reference = reference_history(seed, &[delay_a, delay_b], FRAMES);
        for peer in [&a, &b] {
            for frame in 0..FRAMES {
                prop_assert_eq!(
                    peer.sim.history.get(&frame).copied(),
                    Some(reference[frame as usize])
                );
            }
        }
    }
}

#[test]
fn mispredictions_are_rolled_back() {
    init_tracing();
    let network = MemoryNetwork::with_jitter(vec![1, 3, 2]);
    let (mut a, mut b) = start_pair(&network, 7, [0, 0], 8);
    run_until_confirmed(&network, &mut a, &mut b, FRAMES);

    assert!(a.sim.loads + b.sim.loads > 0);
    assert!(a.sim.resimulated_frames + b.sim.resimulated_frames > 0);
    assert!(!a.sim.resimulating && !b.sim.resimulating);
    let reference = reference_history(7, &[0, 0], FRAMES);
    assert_history(&a, &reference);
    assert_history(&b, &reference);
}

#[test]
fn duplicated_packets_are_harmless() {
    let network = MemoryNetwork::with_jitter(vec![0, 2, 1]).with_duplicates();
    let (mut a, mut b) = start_pair(&network, 99, [1, 0], 8);
    run_until_confirmed(&network, &mut a, &mut b, FRAMES);

    let reference = reference_history(99, &[1, 0], FRAMES);
    assert_history(&a, &reference);
    assert_history(&b, &reference);
}

#[test]
fn duplicate_remote_input_is_ignored() {
    let mut sync_layer = SyncLayer::<StubConfig>::new(2, 8);
    let input = PlayerInput::new(Frame::new(0), StubInput(3));
    assert_eq!(sync_layer.add_remote_input(1, input), Ok(Frame::new(0)));
    assert_eq!(sync_layer.add_remote_input(1, input), Ok(Frame::NULL));
    assert_eq!(sync_layer.last_added_frame(1), Frame::new(0));
    assert!(sync_layer.first_incorrect_frame().is_null());
}

#[test]
fn sessions_synchronize_and_run() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = start_pair(&network, 1, [0, 0], 8);
    assert_eq!(a.session.current_state(), SessionState::Synchronizing);
    assert_eq!(
        a.session.add_local_input(StubInput(1)),
        Err(NetplayError::NotSynchronized)
    );

    synchronize(&network, &mut [&mut a, &mut b]);
    assert_eq!(a.session.current_state(), SessionState::Running);
    assert_eq!(b.session.current_state(), SessionState::Running);

    let events = drain(&mut a);
    assert!(events.contains(&NetplayEvent::Synchronized {
        handle: PlayerHandle::new(2)
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        NetplayEvent::Synchronizing { handle, total: 5, .. } if *handle == PlayerHandle::new(2)
    )));
    assert_eq!(events.last(), Some(&NetplayEvent::Running));
}

#[test]
fn backpressure_stops_local_input_at_the_window() {
    const WINDOW: usize = 6;
    let network = MemoryNetwork::new();
    let (mut a, mut b) = start_pair(&network, 3, [0, 0], WINDOW);
    synchronize(&network, &mut [&mut a, &mut b]);

    network.set_blocked(b.addr, true);
    for _ in 0..WINDOW + 5 {
        network.advance();
        a.tick().unwrap();
    }
    assert_eq!(a.session.current_frame(), Frame::new(WINDOW as i32));
    assert_eq!(a.session.frames_ahead(), WINDOW as i32);
    assert_eq!(
        a.session.add_local_input(StubInput(1)),
        Err(NetplayError::PredictionExhausted)
    );
    assert_eq!(a.session.current_state(), SessionState::Running);

    network.set_blocked(b.addr, false);
    run_until_confirmed(&network, &mut a, &mut b, FRAMES);
    assert!(a.session.current_frame() > Frame::new(WINDOW as i32));
    let reference = reference_history(3, &[0, 0], FRAMES);
    assert_history(&a, &reference);
    assert_history(&b, &reference);
}

#[test]
fn full_window_rolls_back_from_the_first_frame() {
    const WINDOW: usize = 4;
    // player 2's very first input contradicts the default prediction
    let seed = (0..)
        .find(|&seed| scripted_input(seed, PlayerHandle::new(2), 0) != StubInput::default())
        .unwrap();
    let network = MemoryNetwork::new();
    let (mut a, mut b) = start_pair(&network, seed, [0, 0], WINDOW);
    synchronize(&network, &mut [&mut a, &mut b]);

    network.set_blocked(b.addr, true);
    for _ in 0..WINDOW + 3 {
        network.advance();
        a.tick().unwrap();
    }
    assert_eq!(a.session.frames_ahead(), WINDOW as i32);

    network.set_blocked(b.addr, false);
    run_until_confirmed(&network, &mut a, &mut b, FRAMES);
    assert!(a.sim.loads > 0);
    let reference = reference_history(seed, &[0, 0], FRAMES);
    assert_history(&a, &reference);
    assert_history(&b, &reference);
}

#[test]
fn spectator_follows_confirmed_host_input() {
    let network = MemoryNetwork::with_jitter(vec![0, 1]);
    let mut a = Peer::new(SessionBuilder::new(), PlayerHandle::HOST, addr(7101), 11);
    let mut b = Peer::new(SessionBuilder::new(), PlayerHandle::new(2), addr(7102), 11);
    let mut c = Peer::new(SessionBuilder::new(), PlayerHandle::new(3), addr(7103), 11);

    a.start(
        &network,
        &[
            (PlayerHandle::HOST, PlayerType::Local),
            (PlayerHandle::new(2), PlayerType::Remote(b.addr)),
            (PlayerHandle::new(3), PlayerType::Spectator(c.addr)),
        ],
        0,
        8,
    )
    .unwrap();
    b.start(&network, &two_player_roster(b.handle, a.addr), 0, 8)
        .unwrap();
    c.start(
        &network,
        &[
            (PlayerHandle::new(3), PlayerType::Local),
            (PlayerHandle::HOST, PlayerType::Remote(a.addr)),
        ],
        0,
        8,
    )
    .unwrap();

    for _ in 0..5000 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
        c.tick().unwrap();
        if c.session.current_frame() >= Frame::new(FRAMES) {
            break;
        }
    }
    assert_eq!(c.session.current_state(), SessionState::Spectating);
    assert!(c.session.current_frame() >= Frame::new(FRAMES));
    assert_eq!(c.sim.loads, 0);
    assert_eq!(
        c.session.add_local_input(StubInput(1)),
        Err(NetplayError::InvalidRequest {
            info: "Spectators do not contribute input".to_owned()
        })
    );

    let reference = reference_history(11, &[0, 0], FRAMES);
    assert_history(&c, &reference);
}

#[test]
fn time_sync_events_feed_the_pacer() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = start_pair(&network, 5, [0, 0], 8);
    let mut time_syncs = 0;
    for _ in 0..400 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
        time_syncs += drain(&mut a)
            .iter()
            .filter(|e| matches!(e, NetplayEvent::TimeSync { .. }))
            .count();
        if a.session.current_frame() > Frame::new(130) {
            break;
        }
    }
    assert!(time_syncs >= 2, "only {time_syncs} time sync events");
    assert_eq!(a.session.frame_pacer().baseline_us(), 16_666);
}

#[test]
fn matching_checksums_report_no_desync() {
    let network = MemoryNetwork::with_jitter(vec![0, 1]);
    let builder = || SessionBuilder::new().with_desync_detection(DesyncDetection::On { interval: 5 });
    let mut a = Peer::new(builder(), PlayerHandle::HOST, addr(7201), 21);
    let mut b = Peer::new(builder(), PlayerHandle::new(2), addr(7202), 21);
    a.start(&network, &two_player_roster(a.handle, b.addr), 0, 8)
        .unwrap();
    b.start(&network, &two_player_roster(b.handle, a.addr), 0, 8)
        .unwrap();

    let mut desyncs = 0;
    for _ in 0..300 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
        for peer in [&mut a, &mut b] {
            desyncs += drain(peer)
                .iter()
                .filter(|e| matches!(e, NetplayEvent::DesyncDetected { .. }))
                .count();
        }
    }
    assert!(a.session.confirmed_frame() > Frame::new(20));
    assert_eq!(desyncs, 0);
}

#[test]
fn diverging_checksums_report_desync() {
    let network = MemoryNetwork::new();
    let builder = || SessionBuilder::new().with_desync_detection(DesyncDetection::On { interval: 5 });
    let mut a = Peer::new(builder(), PlayerHandle::HOST, addr(7301), 22);
    let mut b = Peer::new(builder(), PlayerHandle::new(2), addr(7302), 22);
    b.sim.checksum_salt = 0xDEAD;
    a.start(&network, &two_player_roster(a.handle, b.addr), 0, 8)
        .unwrap();
    b.start(&network, &two_player_roster(b.handle, a.addr), 0, 8)
        .unwrap();

    let mut reported = None;
    for _ in 0..300 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
        if let Some(event) = drain(&mut a)
            .into_iter()
            .find(|e| matches!(e, NetplayEvent::DesyncDetected { .. }))
        {
            reported = Some(event);
            break;
        }
    }
    let Some(NetplayEvent::DesyncDetected {
        frame,
        local_checksum,
        remote_checksum,
        handle,
    }) = reported
    else {
        panic!("no desync reported");
    };
    assert_eq!(frame.as_i32() % 5, 0);
    assert_eq!(handle, PlayerHandle::new(2));
    assert_eq!(local_checksum ^ remote_checksum, 0xDEAD);
}

#[test]
fn silent_peer_is_interrupted_then_disconnected() {
    init_tracing();
    let network = MemoryNetwork::new();
    let builder = || {
        SessionBuilder::new()
            .with_disconnect_timeout(Duration::from_millis(300))
            .with_disconnect_notify_start(Duration::from_millis(100))
    };
    let mut a = Peer::new(builder(), PlayerHandle::HOST, addr(7401), 31);
    let mut b = Peer::new(builder(), PlayerHandle::new(2), addr(7402), 31);
    a.start(&network, &two_player_roster(a.handle, b.addr), 0, 8)
        .unwrap();
    b.start(&network, &two_player_roster(b.handle, a.addr), 0, 8)
        .unwrap();
    for _ in 0..20 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
    }
    drain(&mut a);

    // b goes silent
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        network.advance();
        a.tick().unwrap();
        events.extend(drain(&mut a));
        if events
            .iter()
            .any(|e| matches!(e, NetplayEvent::Disconnected { .. }))
        {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let interrupted = events.iter().position(|e| {
        *e == NetplayEvent::NetworkInterrupted {
            handle: PlayerHandle::new(2),
            disconnect_timeout: 200,
        }
    });
    let disconnected = events.iter().position(|e| {
        *e == NetplayEvent::Disconnected {
            handle: PlayerHandle::new(2),
        }
    });
    assert!(interrupted.is_some(), "events: {events:?}");
    assert!(disconnected.is_some(), "events: {events:?}");
    assert!(interrupted < disconnected);

    let frame = a.session.current_frame();
    for _ in 0..30 {
        network.advance();
        a.tick().unwrap();
    }
    assert!(a.session.current_frame() > frame);
    assert_eq!(a.sim.last_flags, 0b10);
    assert_eq!(
        a.session.network_stats(PlayerHandle::new(2)),
        Err(NetplayError::PeerTimeout {
            handle: PlayerHandle::new(2)
        })
    );
}

#[test]
fn chat_lines_carry_the_nickname() {
    let network = MemoryNetwork::new();
    let mut a = Peer::new(
        SessionBuilder::new().with_nickname("Alice"),
        PlayerHandle::HOST,
        addr(7501),
        0,
    );
    let mut b = Peer::new(SessionBuilder::new(), PlayerHandle::new(2), addr(7502), 0);
    a.start(&network, &two_player_roster(a.handle, b.addr), 0, 8)
        .unwrap();
    b.start(&network, &two_player_roster(b.handle, a.addr), 0, 8)
        .unwrap();
    synchronize(&network, &mut [&mut a, &mut b]);
    drain(&mut b);

    assert_eq!(a.session.send_chat_message("hi").unwrap(), "Alice: hi");
    network.advance();
    b.session.run_idle();
    assert!(drain(&mut b).contains(&NetplayEvent::ChatMessage {
        handle: PlayerHandle::HOST,
        text: "Alice: hi".to_owned(),
    }));
}

#[test]
fn malformed_rosters_are_rejected() {
    let network = MemoryNetwork::new();
    let me = PlayerHandle::HOST;
    let cases: Vec<Vec<(PlayerHandle, PlayerType<_>)>> = vec![
        // handle 0
        vec![(me, PlayerType::Local), (PlayerHandle::new(0), PlayerType::Remote(addr(1)))],
        // duplicate handle
        vec![
            (me, PlayerType::Local),
            (PlayerHandle::new(2), PlayerType::Remote(addr(1))),
            (PlayerHandle::new(2), PlayerType::Remote(addr(2))),
        ],
        // no local entry
        vec![
            (me, PlayerType::Remote(addr(1))),
            (PlayerHandle::new(2), PlayerType::Remote(addr(2))),
        ],
        // spectator handle registered as a player
        vec![
            (me, PlayerType::Local),
            (PlayerHandle::new(2), PlayerType::Remote(addr(1))),
            (PlayerHandle::new(3), PlayerType::Remote(addr(2))),
        ],
        // same address twice
        vec![
            (me, PlayerType::Local),
            (PlayerHandle::new(2), PlayerType::Remote(addr(1))),
            (PlayerHandle::new(3), PlayerType::Spectator(addr(1))),
        ],
        // player 2 missing
        vec![(me, PlayerType::Local)],
    ];
    for roster in cases {
        let mut session = SessionBuilder::<StubConfig>::new().build().unwrap();
        let err = session
            .start(me, network.socket(addr(7600)), &roster, 0, 8)
            .unwrap_err();
        assert!(
            matches!(err, NetplayError::InvalidSession { .. }),
            "{roster:?} gave {err:?}"
        );
        assert_eq!(session.current_state(), SessionState::Uninitialized);
    }
}

#[test]
fn spectator_roster_needs_a_host() {
    let network = MemoryNetwork::new();
    let mut session = SessionBuilder::<StubConfig>::new().build().unwrap();
    let err = session
        .start(
            PlayerHandle::new(3),
            network.socket(addr(7700)),
            &[
                (PlayerHandle::new(3), PlayerType::Local),
                (PlayerHandle::new(2), PlayerType::Remote(addr(1))),
            ],
            0,
            8,
        )
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidSession { .. }));

    // only player 1 hosts spectators
    let err = session
        .start(
            PlayerHandle::new(2),
            network.socket(addr(7700)),
            &[
                (PlayerHandle::HOST, PlayerType::Remote(addr(1))),
                (PlayerHandle::new(2), PlayerType::Local),
                (PlayerHandle::new(3), PlayerType::Spectator(addr(2))),
            ],
            0,
            8,
        )
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidSession { .. }));
}

#[test]
fn start_rejects_bad_parameters_and_double_start() {
    let network = MemoryNetwork::new();
    let mut session = SessionBuilder::<StubConfig>::new().build().unwrap();
    let roster = two_player_roster(PlayerHandle::HOST, addr(7801));

    let err = session
        .start(PlayerHandle::HOST, network.socket(addr(7800)), &roster, 0, 0)
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidRequest { .. }));

    session
        .start(PlayerHandle::HOST, network.socket(addr(7800)), &roster, 2, 8)
        .unwrap();
    assert_eq!(session.input_delay(), 2);
    let err = session
        .start(PlayerHandle::HOST, network.socket(addr(7800)), &roster, 0, 8)
        .unwrap_err();
    assert!(matches!(err, NetplayError::InvalidRequest { .. }));
}

#[test]
fn close_is_idempotent_and_allows_restart() {
    let network = MemoryNetwork::new();
    let (mut a, mut b) = start_pair(&network, 4, [1, 1], 8);
    synchronize(&network, &mut [&mut a, &mut b]);
    for _ in 0..10 {
        network.advance();
        a.tick().unwrap();
        b.tick().unwrap();
    }
    assert!(a.session.current_frame() > Frame::new(0));

    a.session.close();
    a.session.close();
    assert_eq!(a.session.current_state(), SessionState::Closed);
    assert_eq!(a.session.current_frame(), Frame::new(0));
    assert_eq!(a.session.local_handle(), None);
    assert_eq!(a.session.input_delay(), 0);
    assert_eq!(a.session.tick(&mut a.sim, StubInput(0)), Err(NetplayError::NotSynchronized));

    let roster = two_player_roster(a.handle, addr(7901));
    a.start(&network, &roster, 0, 8).unwrap();
    assert_eq!(a.session.current_state(), SessionState::Synchronizing);
}

#[test]
fn traversal_roster_errors() {
    let mut session = SessionBuilder::<StubConfig>::new().build().unwrap();
    assert!(matches!(
        session.start_traversal(&[], 0, 8),
        Err(NetplayError::InvalidSession { .. })
    ));

    let spectator = [
        Participant::local(0, "Carol", PlayerHandle::new(3)),
        Participant {
            address: "127.0.0.1".to_owned(),
            port: 9,
            nickname: "Bob".to_owned(),
            handle: PlayerHandle::new(2),
        },
    ];
    assert!(matches!(
        session.start_traversal(&spectator, 0, 8),
        Err(NetplayError::InvalidSession { .. })
    ));
    assert_eq!(session.current_state(), SessionState::Uninitialized);
}

#[test]
#[serial]
fn traversal_roster_starts_a_udp_session() {
    let mut session = SessionBuilder::<StubConfig>::new().build().unwrap();
    let roster = [
        Participant::local(0, "Alice", PlayerHandle::HOST),
        Participant {
            address: "127.0.0.1".to_owned(),
            port: 9,
            nickname: "Bob".to_owned(),
            handle: PlayerHandle::new(2),
        },
    ];
    session.start_traversal(&roster, 1, 8).unwrap();
    assert_eq!(session.current_state(), SessionState::Synchronizing);
    assert_eq!(session.config().nickname, "Alice");
    assert_eq!(session.local_handle(), Some(PlayerHandle::HOST));
    assert_eq!(session.input_delay(), 1);
    session.close();
}
