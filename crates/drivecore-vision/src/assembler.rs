//! Two-frame temporal window of warped images.
//!
//! [`FrameAssembler`] warps each incoming frame with the current calibration
//! transform and slides it into a [`TemporalImageStack`].  The stack always
//! holds exactly two frames; on the very first push both slots receive the
//! same image so the network never sees an empty history.

use drivecore_types::FrameDescriptor;
use nalgebra::Matrix3;
use ndarray::{Array3, Array4, Axis, concatenate};

use crate::VisionError;
use crate::warp::{FrameWarper, INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH};

/// Channels of the stacked model image input (two packed frames).
pub const IMAGE_INPUT_CHANNELS: usize = 2 * INPUT_CHANNELS;

/// `[older, newer]` pair of warped frames.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalImageStack {
    slots: [Array3<f32>; 2],
}

impl TemporalImageStack {
    fn seeded(frame: Array3<f32>) -> Self {
        Self {
            slots: [frame.clone(), frame],
        }
    }

    fn push(&mut self, frame: Array3<f32>) {
        self.slots.swap(0, 1);
        self.slots[1] = frame;
    }

    /// The older of the two frames.
    pub fn slot0(&self) -> &Array3<f32> {
        &self.slots[0]
    }

    /// The most recently warped frame.
    pub fn slot1(&self) -> &Array3<f32> {
        &self.slots[1]
    }

    /// Both frames concatenated along the channel axis with a leading batch
    /// axis: `(1, 12, 128, 256)`.
    pub fn to_tensor(&self) -> Array4<f32> {
        // Both slots share a shape by construction.
        concatenate(Axis(0), &[self.slots[0].view(), self.slots[1].view()])
            .unwrap_or_else(|_| Array3::zeros((IMAGE_INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH)))
            .insert_axis(Axis(0))
    }
}

/// Warps frames and maintains the temporal window.
pub struct FrameAssembler<W: FrameWarper> {
    warper: W,
    stack: Option<TemporalImageStack>,
    pushes: u64,
}

impl<W: FrameWarper> FrameAssembler<W> {
    pub fn new(warper: W) -> Self {
        Self {
            warper,
            stack: None,
            pushes: 0,
        }
    }

    /// Warp `frame` through `transform` and slide it into the window.
    ///
    /// # Errors
    ///
    /// Propagates the warper's error.  The window is left exactly as it was,
    /// so the caller can skip the iteration without feeding stale or
    /// half-written data to the network.
    pub fn warp_and_push(
        &mut self,
        frame: &FrameDescriptor,
        transform: &Matrix3<f32>,
    ) -> Result<&TemporalImageStack, VisionError> {
        let warped = self.warper.warp(frame, transform)?;
        let expected = (INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH);
        if warped.dim() != expected {
            return Err(VisionError::MalformedFrame {
                frame_id: frame.frame_id,
                details: format!("warper produced {:?}, expected {expected:?}", warped.dim()),
            });
        }
        self.pushes += 1;
        let stack = match self.stack.take() {
            None => TemporalImageStack::seeded(warped),
            Some(mut stack) => {
                stack.push(warped);
                stack
            }
        };
        let stack: &TemporalImageStack = self.stack.insert(stack);
        Ok(stack)
    }

    /// The current window, or `None` before the first successful push.
    pub fn stack(&self) -> Option<&TemporalImageStack> {
        self.stack.as_ref()
    }

    /// The image input tensor for the next inference, or `None` before the
    /// first successful push.
    pub fn model_input(&self) -> Option<Array4<f32>> {
        self.stack.as_ref().map(TemporalImageStack::to_tensor)
    }

    /// Number of successful pushes since construction.
    pub fn pushes(&self) -> u64 {
        self.pushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a constant tensor whose value is the frame id, or fails on
    /// demand.
    struct IdWarper;

    impl FrameWarper for IdWarper {
        fn warp(
            &mut self,
            frame: &FrameDescriptor,
            _transform: &Matrix3<f32>,
        ) -> Result<Array3<f32>, VisionError> {
            if frame.frame_id == u32::MAX {
                return Err(VisionError::SingularTransform);
            }
            Ok(Array3::from_elem(
                (INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH),
                frame.frame_id as f32,
            ))
        }
    }

    fn frame(id: u32) -> FrameDescriptor {
        FrameDescriptor {
            frame_id: id,
            timestamp_eof: u64::from(id),
            width: 1,
            height: 1,
            pixels: vec![0u8; 3].into(),
            intrinsics: None,
        }
    }

    fn value(a: &Array3<f32>) -> f32 {
        a[[0, 0, 0]]
    }

    #[test]
    fn first_push_seeds_both_slots() {
        let mut assembler = FrameAssembler::new(IdWarper);
        let stack = assembler.warp_and_push(&frame(1), &Matrix3::identity()).unwrap();
        assert_eq!(value(stack.slot0()), 1.0);
        assert_eq!(value(stack.slot1()), 1.0);
    }

    #[test]
    fn window_slides_by_one_each_push() {
        let mut assembler = FrameAssembler::new(IdWarper);
        for n in 1..=5u32 {
            let stack = assembler.warp_and_push(&frame(n), &Matrix3::identity()).unwrap();
            let expected_older = if n == 1 { 1.0 } else { (n - 1) as f32 };
            assert_eq!(value(stack.slot0()), expected_older, "slot0 after push {n}");
            assert_eq!(value(stack.slot1()), n as f32, "slot1 after push {n}");
        }
        assert_eq!(assembler.pushes(), 5);
    }

    #[test]
    fn failed_warp_leaves_window_untouched() {
        let mut assembler = FrameAssembler::new(IdWarper);
        assembler.warp_and_push(&frame(1), &Matrix3::identity()).unwrap();
        assembler.warp_and_push(&frame(2), &Matrix3::identity()).unwrap();
        let before = assembler.stack().cloned();

        let err = assembler
            .warp_and_push(&frame(u32::MAX), &Matrix3::identity())
            .unwrap_err();
        assert_eq!(err, VisionError::SingularTransform);
        assert_eq!(assembler.stack().cloned(), before);
        assert_eq!(assembler.pushes(), 2);
    }

    #[test]
    fn failure_before_first_push_leaves_no_window() {
        let mut assembler = FrameAssembler::new(IdWarper);
        assert!(assembler.warp_and_push(&frame(u32::MAX), &Matrix3::identity()).is_err());
        assert!(assembler.stack().is_none());
        assert!(assembler.model_input().is_none());
    }

    #[test]
    fn model_input_stacks_older_then_newer() {
        let mut assembler = FrameAssembler::new(IdWarper);
        assembler.warp_and_push(&frame(3), &Matrix3::identity()).unwrap();
        assembler.warp_and_push(&frame(4), &Matrix3::identity()).unwrap();
        let tensor = assembler.model_input().unwrap();
        assert_eq!(tensor.dim(), (1, IMAGE_INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH));
        assert_eq!(tensor[[0, 0, 0, 0]], 3.0);
        assert_eq!(tensor[[0, INPUT_CHANNELS, 0, 0]], 4.0);
    }
}
