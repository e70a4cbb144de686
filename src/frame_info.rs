use crate::Frame;

/// A snapshot held in the [`SnapshotRing`](crate::sync_layer::SnapshotRing).
///
/// `frame` is the last frame simulated into the state, so the snapshot keyed
/// [`Frame::NULL`] is the state before frame 0 ran.
#[derive(Debug, Clone)]
pub struct SavedSnapshot<S> {
    /// The last frame simulated into this state.
    pub frame: Frame,
    /// The state blob produced by the simulation.
    pub state: S,
    /// Checksum reported by the simulation together with the blob.
    pub checksum: u128,
}

/// Represents one input of one player for one frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame this input belongs to.
    pub frame: Frame,
    /// The input itself.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> PlayerInput<I> {
    /// Creates a new input for `frame`.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// Creates a default ("no buttons") input for `frame`.
    #[must_use]
    pub fn blank_input(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }
}
