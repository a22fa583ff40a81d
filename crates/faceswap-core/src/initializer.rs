//! Builds the face analysis model (detector + recognizer) from configuration.

use crate::analysis::FaceAnalysis;
use crate::artifact::ModelInitializationArtifact;
use crate::config::Config;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::session::ExecutionDevice;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitializerError {
    #[error("failed to initialize face analysis model {model_name}: {source}")]
    Detector {
        model_name: String,
        #[source]
        source: DetectorError,
    },
    #[error("failed to initialize face analysis model {model_name}: {source}")]
    Recognizer {
        model_name: String,
        #[source]
        source: RecognizerError,
    },
}

pub struct ModelInitializer {
    model_name: String,
    detector_path: PathBuf,
    recognizer_path: PathBuf,
    device: ExecutionDevice,
    det_size: (u32, u32),
}

impl ModelInitializer {
    pub fn new(config: &Config) -> Self {
        Self {
            model_name: config.model_name.clone(),
            detector_path: config.detector_model_path(),
            recognizer_path: config.recognizer_model_path(),
            device: ExecutionDevice::from_ctx_id(config.ctx_id),
            det_size: config.det_size,
        }
    }

    /// Load and prepare the analysis models. Fails on the first error; no retry.
    pub fn initialize_model(&self) -> Result<(FaceAnalysis, ModelInitializationArtifact), InitializerError> {
        tracing::info!(
            model_name = %self.model_name,
            device = ?self.device,
            det_size = ?self.det_size,
            "initializing face analysis model"
        );

        let detector = FaceDetector::load(&self.detector_path, self.device, self.det_size).map_err(|source| {
            tracing::error!(path = %self.detector_path.display(), error = %source, "detector load failed");
            InitializerError::Detector { model_name: self.model_name.clone(), source }
        })?;

        let recognizer = FaceRecognizer::load(&self.recognizer_path, self.device).map_err(|source| {
            tracing::error!(path = %self.recognizer_path.display(), error = %source, "recognizer load failed");
            InitializerError::Recognizer { model_name: self.model_name.clone(), source }
        })?;

        let artifact = ModelInitializationArtifact { model_name: self.model_name.clone() };
        tracing::info!(?artifact, "model initialization artifact created");

        Ok((FaceAnalysis::new(detector, recognizer), artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_detector_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_root: dir.path().to_path_buf(),
            ctx_id: -1,
            ..Config::default()
        };

        let err = ModelInitializer::new(&config).initialize_model().err().unwrap();
        match err {
            InitializerError::Detector { model_name, source } => {
                assert_eq!(model_name, "buffalo_l");
                assert!(matches!(source, DetectorError::ModelNotFound(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
