//! Benchmarks for the rollback hot paths: input prediction, snapshot
//! bookkeeping and resimulation, and loop pacing.
//!
//! Run with: cargo bench --bench rollback

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rollback_netplay::__internal::{ConnectionStatus, InputQueue, PlayerInput, SyncLayer};
use rollback_netplay::{Config, Frame, FramePacer};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::net::SocketAddr;

#[derive(Copy, Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
struct Pad(u8);

struct BenchConfig;

impl Config for BenchConfig {
    type Input = Pad;
    type State = u64;
    type Address = SocketAddr;
}

const WINDOW: usize = 8;

fn bench_input_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue");

    group.bench_function("add_then_read_600_frames", |b| {
        b.iter(|| {
            let mut queue = InputQueue::<Pad>::new();
            for frame in 0..600 {
                let frame = Frame::new(frame);
                queue.add_input(PlayerInput::new(frame, Pad((frame.as_i32() % 5) as u8)));
                black_box(queue.input(frame));
            }
        });
    });

    // reads run ahead of confirmed input, the way a remote player's queue does
    group.bench_function("predict_window_ahead", |b| {
        b.iter(|| {
            let mut queue = InputQueue::<Pad>::new();
            for frame in 0..600 {
                queue.add_input(PlayerInput::new(Frame::new(frame), Pad(1)));
                black_box(queue.input(Frame::new(frame + WINDOW as i32 / 2)));
            }
        });
    });

    group.finish();
}

/// A layer at frame `WINDOW` whose remote input arrives for frame `WINDOW - depth`,
/// contradicting the prediction made there.
fn mispredicted_layer(depth: i32) -> SyncLayer<BenchConfig> {
    let status = vec![ConnectionStatus::default(); 2];
    let mut layer = SyncLayer::<BenchConfig>::new(2, WINDOW);
    layer.save_snapshot(Frame::NULL, 0, 0);
    let mut value = 0_u64;
    for frame in 0..WINDOW as i32 {
        let _ = layer.add_local_input(0, Pad(frame as u8));
        let inputs = layer.synchronized_inputs(&status);
        value = value.wrapping_add(inputs.map_or(0, |i| u64::from(i.inputs[0].0)));
        layer.save_snapshot(Frame::new(frame), value, u128::from(value));
        layer.advance_frame();
    }
    let late = PlayerInput::new(Frame::new(WINDOW as i32 - depth), Pad(9));
    let _ = layer.add_remote_input(1, late);
    layer
}

fn bench_sync_layer(c: &mut Criterion) {
    let mut group = c.benchmark_group("SyncLayer");
    let status = vec![ConnectionStatus::default(); 2];

    for depth in [1, 4, WINDOW as i32] {
        group.bench_with_input(BenchmarkId::new("rollback", depth), &depth, |b, &depth| {
            b.iter_batched(
                || mispredicted_layer(depth),
                |mut layer| {
                    let frontier = layer.current_frame();
                    let first_incorrect = layer.first_incorrect_frame();
                    let mut value = layer
                        .rewind_to(first_incorrect - 1)
                        .map_or(0, |snapshot| snapshot.state);
                    layer.reset_prediction();
                    while layer.current_frame() < frontier {
                        let frame = layer.current_frame();
                        if let Some(inputs) = layer.synchronized_inputs(&status) {
                            value = value.wrapping_add(u64::from(inputs.inputs[1].0));
                        }
                        black_box(layer.save_snapshot(frame, value, u128::from(value)));
                        layer.advance_frame();
                    }
                    layer
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("save_and_evict_600_frames", |b| {
        b.iter(|| {
            let mut layer = SyncLayer::<BenchConfig>::new(2, WINDOW);
            for frame in 0..600 {
                let frame = Frame::new(frame);
                black_box(layer.save_snapshot(frame, frame.as_i32() as u64, 0));
                layer.advance_frame();
                layer.set_last_confirmed_frame(frame - 2);
                black_box(layer.evict_snapshots());
            }
        });
    });

    group.finish();
}

fn bench_frame_pacer(c: &mut Criterion) {
    c.bench_function("FramePacer/correction_over_120_loops", |b| {
        b.iter(|| {
            let mut pacer = FramePacer::new(60, 120);
            pacer.on_time_sync_event(black_box(2.5));
            (0..120).map(|_| pacer.wait_this_loop()).sum::<i64>()
        });
    });
}

criterion_group!(benches, bench_input_queue, bench_sync_layer, bench_frame_pacer);
criterion_main!(benches);
