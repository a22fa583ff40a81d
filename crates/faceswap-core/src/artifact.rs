//! Records produced by model initialization and by a completed swap.

use serde::Serialize;
use std::path::PathBuf;

/// Which face analysis model pack was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInitializationArtifact {
    pub model_name: String,
}

/// Location of a swapped result image on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapperModelArtifact {
    pub result_image_path: PathBuf,
}

impl SwapperModelArtifact {
    /// File name of the result, used for download headers.
    pub fn file_name(&self) -> String {
        self.result_image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        let artifact = SwapperModelArtifact {
            result_image_path: PathBuf::from("Artifacts/results/swapped_face_20240101_120000.jpg"),
        };
        assert_eq!(artifact.file_name(), "swapped_face_20240101_120000.jpg");
    }
}
