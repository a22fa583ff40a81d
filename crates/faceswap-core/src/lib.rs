//! faceswap-core — face detection, identity embedding and face swapping.
//!
//! SCRFD finds faces, ArcFace embeds their identity and inswapper_128 renders
//! a source identity onto target faces, all through ONNX Runtime.

pub mod alignment;
pub mod analysis;
pub mod artifact;
pub mod blend;
pub mod color;
pub mod config;
pub mod detector;
pub mod emap;
pub mod initializer;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod swapper;
pub mod types;

pub use analysis::{FaceAnalysis, FaceAnalyzer, IdentitySwapper, LazySwapper};
pub use artifact::{ModelInitializationArtifact, SwapperModelArtifact};
pub use config::{Config, ConfigError};
pub use initializer::{InitializerError, ModelInitializer};
pub use pipeline::{FaceSwapExecutor, ImageRole, SwapError};
pub use session::ExecutionDevice;
pub use types::{BoundingBox, Embedding, Face};

/// Executor wired to the ONNX-backed models.
pub type OnnxFaceSwap = FaceSwapExecutor<FaceAnalysis, LazySwapper>;
