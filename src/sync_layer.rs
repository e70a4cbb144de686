use std::collections::VecDeque;

use crate::frame_info::{PlayerInput, SavedSnapshot};
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Config, Frame, InputStatus, NetplayError, SynchronizedInputs};

/// Bounded mapping from frame to snapshot, ordered by frame.
///
/// Holds at most `prediction_window + 2` snapshots: the window itself, the
/// snapshot of the last confirmed frame and the one being written.
#[derive(Debug, Clone)]
pub struct SnapshotRing<S> {
    snapshots: VecDeque<SavedSnapshot<S>>,
    capacity: usize,
}

impl<S> SnapshotRing<S> {
    /// Creates an empty ring for the given prediction window.
    #[must_use]
    pub fn new(prediction_window: usize) -> Self {
        let capacity = prediction_window + 2;
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of snapshots currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Returns `true` if no snapshot is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// The oldest retained frame.
    #[must_use]
    pub fn oldest_frame(&self) -> Option<Frame> {
        self.snapshots.front().map(|s| s.frame)
    }

    /// Returns the snapshot for `frame`, if retained.
    #[must_use]
    pub fn get(&self, frame: Frame) -> Option<&SavedSnapshot<S>> {
        self.snapshots.iter().find(|s| s.frame == frame)
    }

    /// Stores a snapshot. Snapshots for `frame` or later (left over from before
    /// a rollback) are replaced. Returns the displaced states so the simulation
    /// can free them.
    pub fn save(&mut self, snapshot: SavedSnapshot<S>) -> Vec<S> {
        let mut displaced = Vec::new();
        while self
            .snapshots
            .back()
            .is_some_and(|last| last.frame >= snapshot.frame)
        {
            if let Some(old) = self.snapshots.pop_back() {
                displaced.push(old.state);
            }
        }
        if self.snapshots.len() == self.capacity {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::StateManagement,
                "Snapshot ring full while saving frame {}, evicting oldest",
                snapshot.frame
            );
            if let Some(old) = self.snapshots.pop_front() {
                displaced.push(old.state);
            }
        }
        self.snapshots.push_back(snapshot);
        displaced
    }

    /// Evicts every snapshot older than `frame`. Returns the evicted states.
    pub fn evict_before(&mut self, frame: Frame) -> Vec<S> {
        let mut evicted = Vec::new();
        while self.snapshots.front().is_some_and(|s| s.frame < frame) {
            if let Some(old) = self.snapshots.pop_front() {
                evicted.push(old.state);
            }
        }
        evicted
    }

    /// Removes every snapshot. Returns the removed states.
    pub fn drain(&mut self) -> Vec<S> {
        self.snapshots.drain(..).map(|s| s.state).collect()
    }
}

/// Input queues and snapshots of one session, advanced frame by frame.
pub struct SyncLayer<T>
where
    T: Config,
{
    num_players: usize,
    prediction_window: usize,
    snapshots: SnapshotRing<T::State>,
    last_confirmed_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue<T::Input>>,
}

impl<T: Config> SyncLayer<T> {
    /// Creates a sync layer for `num_players` player slots.
    #[must_use]
    pub fn new(num_players: usize, prediction_window: usize) -> Self {
        Self {
            num_players,
            prediction_window,
            snapshots: SnapshotRing::new(prediction_window),
            last_confirmed_frame: Frame::NULL,
            current_frame: Frame::new(0),
            input_queues: (0..num_players).map(|_| InputQueue::new()).collect(),
        }
    }

    /// The frame that will be simulated next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The newest frame for which every connected player's input is confirmed.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// Number of frames simulated past the confirmed frontier.
    #[must_use]
    pub fn frames_ahead(&self) -> i32 {
        self.current_frame - self.last_confirmed_frame - 1
    }

    /// The prediction window this layer was built with.
    #[must_use]
    pub fn prediction_window(&self) -> usize {
        self.prediction_window
    }

    /// Number of player slots.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Read access to the snapshot ring.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotRing<T::State> {
        &self.snapshots
    }

    /// Moves to the next frame.
    pub fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// Stores the snapshot taken after simulating `frame`. Returns states to free.
    pub fn save_snapshot(&mut self, frame: Frame, state: T::State, checksum: u128) -> Vec<T::State> {
        self.snapshots.save(SavedSnapshot {
            frame,
            state,
            checksum,
        })
    }

    /// Evicts snapshots older than `current_frame - prediction_window`, never
    /// past the last confirmed frame. Returns states to free.
    pub fn evict_snapshots(&mut self) -> Vec<T::State> {
        let keep_from = self.current_frame - self.prediction_window as i32;
        self.snapshots.evict_before(keep_from.min(self.last_confirmed_frame))
    }

    /// Looks up the snapshot for `frame` and rewinds the frame counter to the
    /// frame after it.
    ///
    /// Fails with [`NetplayError::PredictionExhausted`] when the snapshot was
    /// already evicted.
    pub fn rewind_to(&mut self, frame: Frame) -> Result<&SavedSnapshot<T::State>, NetplayError> {
        if frame >= self.current_frame {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "Cannot rewind to frame {} from current frame {}",
                    frame, self.current_frame
                ),
            });
        }
        if self.snapshots.get(frame).is_none() {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "Snapshot for frame {} was evicted (oldest retained {:?}, current {})",
                frame,
                self.snapshots.oldest_frame(),
                self.current_frame
            );
            return Err(NetplayError::PredictionExhausted);
        }
        self.current_frame = frame + 1;
        self.snapshots
            .get(frame)
            .ok_or(NetplayError::PredictionExhausted)
    }

    /// Adds an input for `slot` at `current_frame`, shifted by the queue's frame delay.
    pub fn add_local_input(&mut self, slot: usize, input: T::Input) -> Result<Frame, NetplayError> {
        let current_frame = self.current_frame;
        let frame = self
            .queue_mut(slot)?
            .add_input(PlayerInput::new(current_frame, input));
        if frame.is_null() {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "Local input for frame {} was already added",
                    current_frame
                ),
            });
        }
        Ok(frame)
    }

    /// Adds a confirmed remote input. Returns [`Frame::NULL`] for duplicates.
    pub fn add_remote_input(
        &mut self,
        slot: usize,
        input: PlayerInput<T::Input>,
    ) -> Result<Frame, NetplayError> {
        Ok(self.queue_mut(slot)?.add_input(input))
    }

    /// Sets the frame delay of one player's queue.
    pub fn set_frame_delay(&mut self, slot: usize, delay: usize) -> Result<(), NetplayError> {
        self.queue_mut(slot)?.set_frame_delay(delay)
    }

    /// The newest confirmed input frame of one player.
    #[must_use]
    pub fn last_added_frame(&self, slot: usize) -> Frame {
        self.input_queues
            .get(slot)
            .map_or(Frame::NULL, InputQueue::last_confirmed_frame)
    }

    /// Returns one input per slot for the current frame.
    ///
    /// Players disconnected before the current frame get the default input with
    /// [`InputStatus::Disconnected`] and their bit set in `disconnect_flags`.
    pub fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Option<SynchronizedInputs<T::Input>> {
        let frame = self.current_frame;
        let mut inputs = Vec::with_capacity(self.num_players);
        let mut statuses = Vec::with_capacity(self.num_players);
        let mut disconnect_flags = 0_u32;
        for (slot, queue) in self.input_queues.iter_mut().enumerate() {
            let status = connect_status.get(slot).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                inputs.push(T::Input::default());
                statuses.push(InputStatus::Disconnected);
                disconnect_flags |= 1 << slot;
            } else {
                let (input, input_status) = queue.input(frame)?;
                inputs.push(input);
                statuses.push(input_status);
            }
        }
        Some(SynchronizedInputs {
            frame,
            inputs,
            statuses,
            disconnect_flags,
        })
    }

    /// Returns one confirmed input per slot for `frame`, or `None` if any
    /// connected player's input for it is still unknown.
    #[must_use]
    pub fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Option<Vec<T::Input>> {
        self.input_queues
            .iter()
            .enumerate()
            .map(|(slot, queue)| {
                let status = connect_status.get(slot).copied().unwrap_or_default();
                if status.disconnected && status.last_frame < frame {
                    Some(T::Input::default())
                } else {
                    queue.confirmed_input(frame)
                }
            })
            .collect()
    }

    /// The earliest mispredicted frame across all queues, or [`Frame::NULL`].
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.input_queues
            .iter()
            .map(InputQueue::first_incorrect_frame)
            .fold(Frame::NULL, Frame::min_known)
    }

    /// Forgets all active predictions.
    pub fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }

    /// Raises the confirmed frontier. Never moves it past a pending misprediction.
    pub fn set_last_confirmed_frame(&mut self, frame: Frame) {
        let first_incorrect = self.first_incorrect_frame();
        let frame = if first_incorrect.is_null() {
            frame
        } else {
            frame.min(first_incorrect - 1)
        };
        let frame = frame.min(self.current_frame - 1);
        if frame > self.last_confirmed_frame {
            self.last_confirmed_frame = frame;
        }
    }

    /// Drops every snapshot. Returns states to free.
    pub fn clear(&mut self) -> Vec<T::State> {
        self.snapshots.drain()
    }

    fn queue_mut(&mut self, slot: usize) -> Result<&mut InputQueue<T::Input>, NetplayError> {
        let num_players = self.num_players;
        self.input_queues
            .get_mut(slot)
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!("Input slot {} out of range for {} players", slot, num_players),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct TestInput(u32);

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = u32;
        type Address = u16;
    }

    fn connected(n: usize) -> Vec<ConnectionStatus> {
        vec![ConnectionStatus::default(); n]
    }

    #[test]
    fn ring_replaces_frames_after_rollback() {
        let mut ring = SnapshotRing::new(4);
        for f in -1..3 {
            ring.save(SavedSnapshot {
                frame: Frame::new(f),
                state: f,
                checksum: 0,
            });
        }
        let displaced = ring.save(SavedSnapshot {
            frame: Frame::new(1),
            state: 100,
            checksum: 0,
        });
        assert_eq!(displaced, vec![2, 1]);
        assert_eq!(ring.get(Frame::new(1)).map(|s| s.state), Some(100));
        assert!(ring.get(Frame::new(2)).is_none());
    }

    #[test]
    fn ring_evicts_old_frames() {
        let mut ring = SnapshotRing::new(8);
        for f in 0..6 {
            ring.save(SavedSnapshot {
                frame: Frame::new(f),
                state: f,
                checksum: 0,
            });
        }
        assert_eq!(ring.evict_before(Frame::new(3)), vec![0, 1, 2]);
        assert_eq!(ring.oldest_frame(), Some(Frame::new(3)));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let mut ring = SnapshotRing::new(2);
        for f in 0..10 {
            ring.save(SavedSnapshot {
                frame: Frame::new(f),
                state: f,
                checksum: 0,
            });
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.oldest_frame(), Some(Frame::new(6)));
    }

    #[test]
    fn synchronized_inputs_mark_disconnected_players() {
        let mut layer = SyncLayer::<TestConfig>::new(2, 8);
        layer.add_local_input(0, TestInput(3)).unwrap();
        let mut status = connected(2);
        status[1] = ConnectionStatus {
            disconnected: true,
            last_frame: Frame::NULL,
        };
        let inputs = layer.synchronized_inputs(&status).unwrap();
        assert_eq!(inputs.inputs, vec![TestInput(3), TestInput(0)]);
        assert_eq!(
            inputs.statuses,
            vec![InputStatus::Confirmed, InputStatus::Disconnected]
        );
        assert_eq!(inputs.disconnect_flags, 0b10);
    }

    #[test]
    fn rewind_to_evicted_frame_is_prediction_exhausted() {
        let mut layer = SyncLayer::<TestConfig>::new(2, 2);
        layer.save_snapshot(Frame::NULL, 0, 0);
        for f in 0..6 {
            layer.save_snapshot(Frame::new(f), f as u32, 0);
            layer.advance_frame();
            layer.evict_snapshots();
        }
        assert_eq!(
            layer.rewind_to(Frame::new(0)).err(),
            Some(NetplayError::PredictionExhausted)
        );
        assert!(layer.rewind_to(Frame::new(4)).is_ok());
        assert_eq!(layer.current_frame(), Frame::new(5));
    }

    #[test]
    fn confirmed_frame_stops_before_misprediction() {
        let mut layer = SyncLayer::<TestConfig>::new(2, 8);
        let status = connected(2);
        layer.add_remote_input(1, PlayerInput::new(Frame::new(0), TestInput(1))).unwrap();
        for _ in 0..3 {
            let frame = layer.current_frame();
            layer.add_local_input(0, TestInput(frame.as_i32() as u32)).unwrap();
            layer.synchronized_inputs(&status).unwrap();
            layer.advance_frame();
        }
        layer.add_remote_input(1, PlayerInput::new(Frame::new(1), TestInput(1))).unwrap();
        layer.add_remote_input(1, PlayerInput::new(Frame::new(2), TestInput(9))).unwrap();
        assert_eq!(layer.first_incorrect_frame(), Frame::new(2));
        layer.set_last_confirmed_frame(Frame::new(2));
        assert_eq!(layer.last_confirmed_frame(), Frame::new(1));
    }
}
