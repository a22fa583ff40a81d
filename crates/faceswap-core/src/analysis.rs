//! Face analysis (detection + identity) and the swap seams used by the pipeline.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::session::ExecutionDevice;
use crate::swapper::{FaceSwapper, SwapperError};
use crate::types::Face;
use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Finds faces in a frame, in a stable order.
pub trait FaceAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Face>, AnalysisError>;
}

/// Transfers an identity from one detected face onto another.
pub trait IdentitySwapper {
    /// Make sure the swap weights are usable. Called before any image work.
    fn prepare(&mut self) -> Result<(), SwapperError>;

    fn swap(&mut self, frame: &RgbImage, target: &Face, source: &Face) -> Result<RgbImage, SwapperError>;
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct FaceAnalysis {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalysis {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }
}

impl FaceAnalyzer for FaceAnalysis {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<Face>, AnalysisError> {
        let boxes = self.detector.detect(frame)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.recognizer.extract(frame, &bbox)?;
            faces.push(Face { bbox, embedding: Some(embedding) });
        }
        Ok(faces)
    }
}

/// Swapper loaded on first use.
///
/// The weight file is checked on every `prepare`, so a file removed while
/// the process runs fails requests with `ModelNotFound` rather than serving
/// from the cached session.
pub struct LazySwapper {
    model_path: PathBuf,
    device: ExecutionDevice,
    model: Option<FaceSwapper>,
}

impl LazySwapper {
    pub fn new(model_path: impl Into<PathBuf>, device: ExecutionDevice) -> Self {
        Self {
            model_path: model_path.into(),
            device,
            model: None,
        }
    }
}

impl IdentitySwapper for LazySwapper {
    fn prepare(&mut self) -> Result<(), SwapperError> {
        if !self.model_path.exists() {
            tracing::error!(path = %self.model_path.display(), "swapper model file not found");
            return Err(SwapperError::ModelNotFound(self.model_path.clone()));
        }
        if self.model.is_none() {
            tracing::info!(path = %self.model_path.display(), "loading face swapper model");
            self.model = Some(FaceSwapper::load(&self.model_path, self.device)?);
            tracing::info!("face swapper model loaded");
        }
        Ok(())
    }

    fn swap(&mut self, frame: &RgbImage, target: &Face, source: &Face) -> Result<RgbImage, SwapperError> {
        self.prepare()?;
        match self.model.as_mut() {
            Some(model) => model.swap(frame, target, source),
            None => Err(SwapperError::ModelNotFound(self.model_path.clone())),
        }
    }
}
