use crate::frame_info::PlayerInput;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Frame, InputStatus, NetplayError};

/// Number of frames an input queue retains.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// The largest frame delay a queue can absorb.
pub const MAX_FRAME_DELAY: usize = INPUT_QUEUE_LENGTH - 1;

/// Per-player sequence of inputs, indexed by frame.
///
/// Entries up to `last_added_frame` are confirmed and are never overwritten.
/// Requests past that frontier are answered with a prediction that repeats the
/// last confirmed input; once the real input for a predicted frame arrives and
/// differs, `first_incorrect_frame` marks where the session has to roll back to.
#[derive(Debug, Clone)]
pub struct InputQueue<I>
where
    I: Copy + Clone + PartialEq + Default,
{
    /// Ring of confirmed inputs, slot `frame % len`.
    inputs: Vec<PlayerInput<I>>,
    /// The newest confirmed frame.
    last_added_frame: Frame,
    /// The first frame whose served prediction turned out wrong.
    first_incorrect_frame: Frame,
    /// The newest frame an input was requested for.
    last_requested_frame: Frame,
    /// Active prediction: `frame` is the first predicted frame still unconfirmed.
    prediction: PlayerInput<I>,
    /// Local input is stored this many frames in the future.
    frame_delay: usize,
    last_confirmed_input: Option<I>,
}

impl<I> Default for InputQueue<I>
where
    I: Copy + Clone + PartialEq + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I> InputQueue<I>
where
    I: Copy + Clone + PartialEq + Default,
{
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inputs: vec![PlayerInput::blank_input(Frame::NULL); INPUT_QUEUE_LENGTH],
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            prediction: PlayerInput::blank_input(Frame::NULL),
            frame_delay: 0,
            last_confirmed_input: None,
        }
    }

    /// The newest confirmed frame, or [`Frame::NULL`] if nothing was added yet.
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// The first frame whose prediction was wrong, or [`Frame::NULL`].
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// The currently configured frame delay.
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Sets the frame delay. Only the local queue of a session uses one.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), NetplayError> {
        if delay > MAX_FRAME_DELAY {
            return Err(NetplayError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {}",
                    delay, MAX_FRAME_DELAY
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Forgets the active prediction. Called after a rollback so that the
    /// resimulation requests inputs from scratch.
    pub fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the confirmed input for `frame`, if it is still retained.
    pub fn confirmed_input(&self, frame: Frame) -> Option<I> {
        if !frame.is_valid() || frame > self.last_added_frame {
            return None;
        }
        let slot = &self.inputs[Self::slot(frame)];
        (slot.frame == frame).then_some(slot.input)
    }

    /// Returns the input for `frame`: confirmed if known, otherwise predicted.
    ///
    /// Returns `None` while a misprediction is pending (the caller must roll back
    /// first) or when the confirmed input was already evicted.
    pub fn input(&mut self, frame: Frame) -> Option<(I, InputStatus)> {
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Input requested for frame {} while a misprediction at frame {} is pending",
                frame,
                self.first_incorrect_frame
            );
            return None;
        }

        self.last_requested_frame = frame;

        if self.prediction.frame.is_null() && frame <= self.last_added_frame {
            let slot = &self.inputs[Self::slot(frame)];
            if slot.frame != frame {
                report_violation!(
                    ViolationSeverity::Critical,
                    ViolationKind::InputQueue,
                    "Confirmed input for frame {} was evicted (slot holds frame {})",
                    frame,
                    slot.frame
                );
                return None;
            }
            return Some((slot.input, InputStatus::Confirmed));
        }

        if self.prediction.frame.is_null() {
            self.prediction = PlayerInput::new(
                self.last_added_frame + 1,
                self.last_confirmed_input.unwrap_or_default(),
            );
        }
        Some((self.prediction.input, InputStatus::Predicted))
    }

    /// Adds a confirmed input.
    ///
    /// The input is stored at `input.frame + frame_delay`. Returns the frame it
    /// was stored at, or [`Frame::NULL`] if it was a duplicate, stale or out of
    /// sequence and therefore dropped.
    pub fn add_input(&mut self, input: PlayerInput<I>) -> Frame {
        if !input.frame.is_valid() {
            return Frame::NULL;
        }
        let target = input.frame + self.frame_delay as i32;
        let expected = self.last_added_frame + 1;

        if target < expected {
            // duplicate or stale
            return Frame::NULL;
        }
        if target > expected {
            if !self.last_added_frame.is_null() {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InputQueue,
                    "Dropping out-of-sequence input for frame {} (expected {})",
                    target,
                    expected
                );
                return Frame::NULL;
            }
            // fill the delay gap in front of the very first input
            let mut frame = expected;
            while frame < target {
                self.store(frame, I::default());
                frame += 1;
            }
        }

        self.store(target, input.input);
        target
    }

    fn store(&mut self, frame: Frame, input: I) {
        self.inputs[Self::slot(frame)] = PlayerInput::new(frame, input);
        self.last_added_frame = frame;
        self.last_confirmed_input = Some(input);

        if self.prediction.frame.is_null() {
            return;
        }
        if frame != self.prediction.frame {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Confirmed frame {} doesn't match prediction frame {}",
                frame,
                self.prediction.frame
            );
            return;
        }
        if self.first_incorrect_frame.is_null() && self.prediction.input != input {
            self.first_incorrect_frame = frame;
        }
        if self.prediction.frame == self.last_requested_frame && self.first_incorrect_frame.is_null()
        {
            // caught up with everything we handed out
            self.prediction.frame = Frame::NULL;
        } else {
            self.prediction.frame += 1;
        }
    }

    fn slot(frame: Frame) -> usize {
        frame.as_i32().rem_euclid(INPUT_QUEUE_LENGTH as i32) as usize
    }
}
