//! Perspective warp and colorspace packing.
//!
//! The network expects each camera frame as a 512×256 view of the road,
//! converted to YUV 4:2:0 and packed into six half-resolution planes:
//!
//! ```text
//! ch0  Y[even rows, even cols]
//! ch1  Y[odd rows,  even cols]
//! ch2  Y[even rows, odd cols]
//! ch3  Y[odd rows,  odd cols]
//! ch4  U (2×2 block average)
//! ch5  V (2×2 block average)
//! ```
//!
//! Values stay in the raw `0.0..=255.0` range.

use drivecore_types::FrameDescriptor;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3};

use crate::VisionError;
use crate::calibration::MEDMODEL_INPUT_SIZE;

/// Planes per packed frame.
pub const INPUT_CHANNELS: usize = 6;
/// Rows of each packed plane.
pub const INPUT_HEIGHT: usize = MEDMODEL_INPUT_SIZE.1 as usize / 2;
/// Columns of each packed plane.
pub const INPUT_WIDTH: usize = MEDMODEL_INPUT_SIZE.0 as usize / 2;

/// Projects a raw camera frame into packed model-input space.
///
/// Implementations must return an array of shape
/// `(INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH)` or an error; never a
/// partially written tensor.
pub trait FrameWarper: Send {
    fn warp(
        &mut self,
        frame: &FrameDescriptor,
        transform: &Matrix3<f32>,
    ) -> Result<Array3<f32>, VisionError>;
}

impl<W: FrameWarper + ?Sized> FrameWarper for Box<W> {
    fn warp(
        &mut self,
        frame: &FrameDescriptor,
        transform: &Matrix3<f32>,
    ) -> Result<Array3<f32>, VisionError> {
        (**self).warp(frame, transform)
    }
}

/// Reference warper running entirely on the CPU.
///
/// Each output pixel is mapped back into the camera frame through the
/// inverse transform and bilinearly sampled; samples that fall outside the
/// frame are black.
#[derive(Debug, Default)]
pub struct CpuWarper;

impl CpuWarper {
    pub fn new() -> Self {
        Self
    }
}

impl FrameWarper for CpuWarper {
    fn warp(
        &mut self,
        frame: &FrameDescriptor,
        transform: &Matrix3<f32>,
    ) -> Result<Array3<f32>, VisionError> {
        if !frame.is_well_formed() {
            return Err(VisionError::MalformedFrame {
                frame_id: frame.frame_id,
                details: format!(
                    "{}×{} frame carries {} bytes, expected {}",
                    frame.width,
                    frame.height,
                    frame.pixels.len(),
                    frame.expected_len()
                ),
            });
        }
        if !transform.iter().all(|v| v.is_finite()) {
            return Err(VisionError::SingularTransform);
        }
        let inverse = transform
            .cast::<f64>()
            .try_inverse()
            .ok_or(VisionError::SingularTransform)?;

        let rgb = warp_rgb(frame, &inverse);
        Ok(pack_yuv(&rgb))
    }
}

/// Inverse-map every model pixel into the camera frame. Returns an
/// `(H, W, 3)` RGB array.
fn warp_rgb(frame: &FrameDescriptor, model_to_camera: &Matrix3<f64>) -> Array3<f32> {
    let (out_w, out_h) = (MEDMODEL_INPUT_SIZE.0 as usize, MEDMODEL_INPUT_SIZE.1 as usize);
    let (w, h) = (frame.width as usize, frame.height as usize);
    let px = &frame.pixels;
    let fetch = |x: usize, y: usize, c: usize| f64::from(px[(y * w + x) * 3 + c]);

    let mut out = Array3::<f32>::zeros((out_h, out_w, 3));
    for v in 0..out_h {
        for u in 0..out_w {
            let p = model_to_camera * Vector3::new(u as f64, v as f64, 1.0);
            if p.z.abs() < f64::EPSILON {
                continue;
            }
            let (sx, sy) = (p.x / p.z, p.y / p.z);
            if !(sx >= 0.0 && sy >= 0.0 && sx <= (w - 1) as f64 && sy <= (h - 1) as f64) {
                continue;
            }
            let (x0, y0) = (sx.floor() as usize, sy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
            let (fx, fy) = (sx - x0 as f64, sy - y0 as f64);
            for c in 0..3 {
                let top = fetch(x0, y0, c) * (1.0 - fx) + fetch(x1, y0, c) * fx;
                let bottom = fetch(x0, y1, c) * (1.0 - fx) + fetch(x1, y1, c) * fx;
                out[[v, u, c]] = (top * (1.0 - fy) + bottom * fy) as f32;
            }
        }
    }
    out
}

/// BT.601 RGB → YUV 4:2:0, packed into six planes.
fn pack_yuv(rgb: &Array3<f32>) -> Array3<f32> {
    let (h, w, _) = rgb.dim();
    let mut y_plane = Array2::<f32>::zeros((h, w));
    let mut u_full = Array2::<f32>::zeros((h, w));
    let mut v_full = Array2::<f32>::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let (red, green, blue) = (rgb[[r, c, 0]], rgb[[r, c, 1]], rgb[[r, c, 2]]);
            y_plane[[r, c]] = 0.299 * red + 0.587 * green + 0.114 * blue;
            u_full[[r, c]] = -0.169 * red - 0.331 * green + 0.5 * blue + 128.0;
            v_full[[r, c]] = 0.5 * red - 0.419 * green - 0.081 * blue + 128.0;
        }
    }

    let mut packed = Array3::<f32>::zeros((INPUT_CHANNELS, h / 2, w / 2));
    for r in 0..h / 2 {
        for c in 0..w / 2 {
            let (r2, c2) = (2 * r, 2 * c);
            packed[[0, r, c]] = y_plane[[r2, c2]];
            packed[[1, r, c]] = y_plane[[r2 + 1, c2]];
            packed[[2, r, c]] = y_plane[[r2, c2 + 1]];
            packed[[3, r, c]] = y_plane[[r2 + 1, c2 + 1]];
            packed[[4, r, c]] = 0.25
                * (u_full[[r2, c2]] + u_full[[r2 + 1, c2]] + u_full[[r2, c2 + 1]] + u_full[[r2 + 1, c2 + 1]]);
            packed[[5, r, c]] = 0.25
                * (v_full[[r2, c2]] + v_full[[r2 + 1, c2]] + v_full[[r2, c2 + 1]] + v_full[[r2 + 1, c2 + 1]]);
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::calibration::CalibrationTracker;

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> FrameDescriptor {
        let pixels: Arc<[u8]> = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        FrameDescriptor {
            frame_id: 1,
            timestamp_eof: 0,
            width,
            height,
            pixels,
            intrinsics: None,
        }
    }

    #[test]
    fn packed_shape_matches_model_input() {
        let frame = solid_frame(1164, 874, [10, 20, 30]);
        let tracker = CalibrationTracker::new();
        let out = CpuWarper::new().warp(&frame, tracker.transform()).unwrap();
        assert_eq!(out.dim(), (INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH));
    }

    #[test]
    fn white_frame_yields_full_luma_and_neutral_chroma() {
        let frame = solid_frame(1164, 874, [255, 255, 255]);
        let tracker = CalibrationTracker::new();
        let out = CpuWarper::new().warp(&frame, tracker.transform()).unwrap();
        // Bottom-centre of the model view is well inside the camera frame.
        let (r, c) = (INPUT_HEIGHT - 10, INPUT_WIDTH / 2);
        assert!((out[[0, r, c]] - 255.0).abs() < 0.5);
        assert!((out[[4, r, c]] - 128.0).abs() < 0.5);
        assert!((out[[5, r, c]] - 128.0).abs() < 0.5);
    }

    #[test]
    fn samples_outside_the_frame_are_black() {
        let frame = solid_frame(8, 8, [255, 255, 255]);
        let out = CpuWarper::new().warp(&frame, &Matrix3::identity()).unwrap();
        // Identity maps most of the 512×256 view past an 8×8 frame.
        assert_eq!(out[[0, INPUT_HEIGHT - 1, INPUT_WIDTH - 1]], 0.0);
        assert!(out[[0, 0, 0]] > 250.0);
    }

    #[test]
    fn singular_transform_is_an_error() {
        let frame = solid_frame(8, 8, [1, 2, 3]);
        let err = CpuWarper::new().warp(&frame, &Matrix3::zeros()).unwrap_err();
        assert_eq!(err, VisionError::SingularTransform);
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let mut frame = solid_frame(8, 8, [1, 2, 3]);
        frame.pixels = vec![0u8; 10].into();
        let err = CpuWarper::new().warp(&frame, &Matrix3::identity()).unwrap_err();
        assert!(matches!(err, VisionError::MalformedFrame { frame_id: 1, .. }));
    }
}
