use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// L2-normalized identity embedding (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

/// A face found by the analyzer.
///
/// Callers outside the model code treat this as an opaque token: it goes from
/// detection straight into a swap call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub bbox: BoundingBox,
    /// Identity embedding, present when the analyzer ran recognition.
    pub embedding: Option<Embedding>,
}

impl Face {
    pub fn landmarks(&self) -> Option<&[(f32, f32); 5]> {
        self.bbox.landmarks.as_ref()
    }
}
