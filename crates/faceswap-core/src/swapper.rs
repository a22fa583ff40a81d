//! inswapper_128 identity swapper via ONNX Runtime.
//!
//! Each swap aligns the target face to a 128×128 crop, runs the generator
//! with the source identity latent, and blends the generated crop back.

use crate::alignment;
use crate::blend;
use crate::color;
use crate::emap::{self, EmapError};
use crate::recognizer::{l2_normalize, ARCFACE_EMBEDDING_DIM};
use crate::session::{build_session, ExecutionDevice};
use crate::types::{Embedding, Face};
use image::RgbImage;
use ndarray::{Array2, ArrayView1};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INSWAPPER_INPUT_SIZE: u32 = 128;
const INSWAPPER_MEAN: f32 = 0.0;
const INSWAPPER_STD: f32 = 255.0;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("Swapper model not found at: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("invalid swapper model: {0}")]
    InvalidModel(String),
    #[error("emap: {0}")]
    Emap(#[from] EmapError),
    #[error("target face has no landmarks")]
    NoLandmarks,
    #[error("source face has no identity embedding")]
    NoEmbedding,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Generator session plus the identity projection it was trained with.
pub struct FaceSwapper {
    session: Session,
    emap: Array2<f32>,
}

impl FaceSwapper {
    /// Load the inswapper ONNX model and its embedded emap matrix.
    pub fn load(model_path: &Path, device: ExecutionDevice) -> Result<Self, SwapperError> {
        if !model_path.exists() {
            return Err(SwapperError::ModelNotFound(model_path.to_path_buf()));
        }

        let emap = emap::load_emap(model_path)?;
        if emap.shape() != [ARCFACE_EMBEDDING_DIM, ARCFACE_EMBEDDING_DIM] {
            return Err(SwapperError::InvalidModel(format!(
                "emap must be {ARCFACE_EMBEDDING_DIM}x{ARCFACE_EMBEDDING_DIM}, got {:?}",
                emap.shape()
            )));
        }

        let session = build_session(model_path, device)?;
        if session.inputs().len() != 2 {
            return Err(SwapperError::InvalidModel(format!(
                "expected 2 inputs (target, source), got {}",
                session.inputs().len()
            )));
        }

        Ok(Self { session, emap })
    }

    /// Replace the identity of `target` in `frame` with that of `source`.
    ///
    /// Returns a new frame; `frame` is left untouched.
    pub fn swap(&mut self, frame: &RgbImage, target: &Face, source: &Face) -> Result<RgbImage, SwapperError> {
        let landmarks = target.landmarks().ok_or(SwapperError::NoLandmarks)?;
        let embedding = source.embedding.as_ref().ok_or(SwapperError::NoEmbedding)?;

        let latent = source_latent(embedding, &self.emap)?;
        let aligned = alignment::align_face(frame, landmarks, INSWAPPER_INPUT_SIZE);
        let blob = color::frame_to_nchw(&aligned.crop, INSWAPPER_MEAN, INSWAPPER_STD);

        let outputs = self.session.run(ort::inputs![
            TensorRef::from_array_view(blob.view())?,
            TensorRef::from_array_view(latent.view())?
        ])?;

        let (_, pred) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapperError::InferenceFailed(format!("generator output: {e}")))?;

        let fake = color::nchw_to_frame(pred, INSWAPPER_INPUT_SIZE, INSWAPPER_INPUT_SIZE, 255.0)
            .ok_or_else(|| {
                SwapperError::InferenceFailed(format!(
                    "generator output holds {} values, expected {}",
                    pred.len(),
                    3 * INSWAPPER_INPUT_SIZE * INSWAPPER_INPUT_SIZE
                ))
            })?;

        Ok(blend::paste_back(frame, &fake, &aligned.matrix))
    }
}

/// Project a normalized identity embedding through `emap` and re-normalize,
/// shaped `[1, dim]` for the generator.
fn source_latent(embedding: &Embedding, emap: &Array2<f32>) -> Result<Array2<f32>, SwapperError> {
    if embedding.values.len() != emap.nrows() {
        return Err(SwapperError::InvalidModel(format!(
            "embedding has {} values, emap expects {}",
            embedding.values.len(),
            emap.nrows()
        )));
    }

    let projected = ArrayView1::from(&embedding.values[..]).dot(emap);
    let normalized = l2_normalize(projected.to_vec());
    let dim = normalized.len();
    Array2::from_shape_vec((1, dim), normalized)
        .map_err(|e| SwapperError::InferenceFailed(format!("latent shape: {e}")))
}
