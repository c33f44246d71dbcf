//! Inference backend seam.
//!
//! The network itself is opaque to the pipeline: a synchronous call that
//! takes the four model inputs and returns one flat `f32` output vector.
//! [`NetworkBuilder`] loads a backend from the weight artifact on the
//! pipeline thread; [`InferenceBackend`] executes it.
//!
//! [`ReplayBackend`] is the in-tree backend.  Its artifact is a recording of
//! raw network outputs (little-endian `f32`, a whole number of
//! [`NET_OUTPUT_SIZE`]-long vectors) which it plays back in a loop, checking
//! input shapes on every call like a real runtime would.

use std::path::{Path, PathBuf};

use drivecore_types::{DESIRE_LEN, DesireVector, DriveError, STATE_LEN, TRAFFIC_CONVENTION_LEN};
use drivecore_vision::assembler::IMAGE_INPUT_CHANNELS;
use drivecore_vision::parser::NET_OUTPUT_SIZE;
use drivecore_vision::warp::{INPUT_HEIGHT, INPUT_WIDTH};
use ndarray::Array4;
use thiserror::Error;
use tracing::{debug, info};

/// Shape of the stacked image input.
pub const IMAGE_INPUT_SHAPE: (usize, usize, usize, usize) = (1, IMAGE_INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("failed to load model from {path}: {details}")]
    Load { path: PathBuf, details: String },
    #[error("input {input} has shape {actual}, expected {expected}")]
    Shape {
        input: &'static str,
        expected: String,
        actual: String,
    },
    #[error("inference failed: {0}")]
    Execution(String),
}

impl From<BackendError> for DriveError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Load { .. } => DriveError::FatalStartup(e.to_string()),
            other => DriveError::DecodeFailure(other.to_string()),
        }
    }
}

/// One set of network inputs, borrowed from the pipeline's state.
#[derive(Debug, Clone, Copy)]
pub struct ModelInputs<'a> {
    /// `(1, 12, 128, 256)` stacked frames.
    pub images: &'a Array4<f32>,
    pub desire: &'a DesireVector,
    pub traffic_convention: &'a [f32; TRAFFIC_CONVENTION_LEN],
    pub recurrent_state: &'a [f32],
}

impl ModelInputs<'_> {
    fn validate(&self) -> Result<(), BackendError> {
        if self.images.dim() != IMAGE_INPUT_SHAPE {
            return Err(BackendError::Shape {
                input: "input_imgs",
                expected: format!("{IMAGE_INPUT_SHAPE:?}"),
                actual: format!("{:?}", self.images.dim()),
            });
        }
        if self.recurrent_state.len() != STATE_LEN {
            return Err(BackendError::Shape {
                input: "initial_state",
                expected: format!("(1, {STATE_LEN})"),
                actual: format!("(1, {})", self.recurrent_state.len()),
            });
        }
        Ok(())
    }
}

/// A loaded network.
pub trait InferenceBackend: Send {
    /// Run one synchronous inference and return the raw output vector.
    fn execute(&mut self, inputs: &ModelInputs<'_>) -> Result<Vec<f32>, BackendError>;
}

/// Loads an [`InferenceBackend`] from the weight artifact.
pub trait NetworkBuilder: Send {
    fn build(&self, model_path: &Path) -> Result<Box<dyn InferenceBackend>, BackendError>;
}

/// Run `iterations` throwaway inferences on all-zero inputs.
pub fn warmup(backend: &mut dyn InferenceBackend, iterations: usize) -> Result<(), BackendError> {
    let images = Array4::<f32>::zeros(IMAGE_INPUT_SHAPE);
    let desire = [0.0; DESIRE_LEN];
    let traffic = [0.0; TRAFFIC_CONVENTION_LEN];
    let state = vec![0.0; STATE_LEN];
    let inputs = ModelInputs {
        images: &images,
        desire: &desire,
        traffic_convention: &traffic,
        recurrent_state: &state,
    };
    for _ in 0..iterations {
        backend.execute(&inputs)?;
    }
    debug!(iterations, "backend warmup finished");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay backend
// ─────────────────────────────────────────────────────────────────────────────

/// Plays back recorded network outputs.
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    outputs: Vec<Vec<f32>>,
    cursor: usize,
    executions: u64,
}

impl ReplayBackend {
    /// Build from in-memory output vectors.
    pub fn from_outputs(outputs: Vec<Vec<f32>>) -> Result<Self, BackendError> {
        if outputs.is_empty() {
            return Err(BackendError::Execution("replay needs at least one output".into()));
        }
        Ok(Self {
            outputs,
            cursor: 0,
            executions: 0,
        })
    }

    /// Load a recording from `path`.
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let load_err = |details: String| BackendError::Load {
            path: path.to_path_buf(),
            details,
        };
        let bytes = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
        let frame_bytes = NET_OUTPUT_SIZE * 4;
        if bytes.is_empty() || bytes.len() % frame_bytes != 0 {
            return Err(load_err(format!(
                "{} bytes is not a whole number of {NET_OUTPUT_SIZE}-value outputs",
                bytes.len()
            )));
        }
        let outputs = bytes
            .chunks_exact(frame_bytes)
            .map(|frame| {
                frame
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            })
            .collect::<Vec<Vec<f32>>>();
        info!(path = %path.display(), outputs = outputs.len(), "replay model loaded");
        Self::from_outputs(outputs)
    }

    /// Serialize `outputs` in the format [`ReplayBackend::load`] reads.
    pub fn encode_recording(outputs: &[Vec<f32>]) -> Vec<u8> {
        outputs
            .iter()
            .flat_map(|o| o.iter().flat_map(|v| v.to_le_bytes()))
            .collect()
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }
}

impl InferenceBackend for ReplayBackend {
    fn execute(&mut self, inputs: &ModelInputs<'_>) -> Result<Vec<f32>, BackendError> {
        inputs.validate()?;
        let out = self.outputs[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.outputs.len();
        self.executions += 1;
        Ok(out)
    }
}

/// Builds a [`ReplayBackend`] from the configured model path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayBuilder;

impl NetworkBuilder for ReplayBuilder {
    fn build(&self, model_path: &Path) -> Result<Box<dyn InferenceBackend>, BackendError> {
        Ok(Box::new(ReplayBackend::load(model_path)?))
    }
}
