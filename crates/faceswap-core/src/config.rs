use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MODEL_NAME: &str = "buffalo_l";
pub const DEFAULT_SWAPPER_MODEL: &str = "weights/inswapper_128.onnx";
/// Negative selects CPU; 0 and up select that CUDA device.
pub const DEFAULT_CTX_ID: i32 = 0;
pub const DEFAULT_DET_SIZE: (u32, u32) = (640, 640);
pub const DEFAULT_OUTPUT_DIR: &str = "Artifacts";
pub const DEFAULT_RESULT_DIR: &str = "results";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_SWAPPER_URL: &str = "https://drive.usercontent.google.com/download?id=1krOLgjW2tAPaqV-Bw4YALz0xT5zlb5HF&export=download&authuser=0";
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

const DETECTOR_FILE: &str = "det_10g.onnx";
const RECOGNIZER_FILE: &str = "w600k_r50.onnx";
/// SCRFD's coarsest stride; input sides must be multiples of it.
const DET_SIZE_ALIGNMENT: u32 = 32;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("detection size {0}x{1} must be positive multiples of 32")]
    InvalidDetSize(u32, u32),
    #[error("{0} is not configured")]
    Missing(&'static str),
}

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Face analysis model pack name (directory under `model_root`).
    pub model_name: String,
    /// Root directory holding model packs.
    pub model_root: PathBuf,
    /// Path to the inswapper ONNX weights.
    pub swapper_model_path: PathBuf,
    /// Execution device selector.
    pub ctx_id: i32,
    /// Detector input size (width, height).
    pub det_size: (u32, u32),
    pub output_dir: PathBuf,
    /// Result subdirectory under `output_dir`.
    pub result_dir: String,
    pub upload_dir: PathBuf,
    /// Where `fetch-model` downloads the swapper weights from.
    pub swapper_url: String,
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    /// Results older than this are swept; 0 keeps them forever.
    pub result_retention_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            model_root: default_model_root(),
            swapper_model_path: PathBuf::from(DEFAULT_SWAPPER_MODEL),
            ctx_id: DEFAULT_CTX_ID,
            det_size: DEFAULT_DET_SIZE,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            result_dir: DEFAULT_RESULT_DIR.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            swapper_url: DEFAULT_SWAPPER_URL.to_string(),
            bind_addr: DEFAULT_BIND.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            result_retention_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from `FACESWAP_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, then validate it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let det_size = match lookup("FACESWAP_DET_SIZE") {
            Some(v) => parse_det_size(&v).ok_or(ConfigError::InvalidValue {
                key: "FACESWAP_DET_SIZE",
                value: v,
            })?,
            None => defaults.det_size,
        };

        let config = Self {
            model_name: lookup("FACESWAP_MODEL_NAME").unwrap_or(defaults.model_name),
            model_root: lookup("FACESWAP_MODEL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_root),
            swapper_model_path: lookup("FACESWAP_SWAPPER_MODEL")
                .map(PathBuf::from)
                .unwrap_or(defaults.swapper_model_path),
            ctx_id: parse_var(&lookup, "FACESWAP_CTX_ID", defaults.ctx_id)?,
            det_size,
            output_dir: lookup("FACESWAP_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            result_dir: lookup("FACESWAP_RESULT_DIR").unwrap_or(defaults.result_dir),
            upload_dir: lookup("FACESWAP_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            swapper_url: lookup("FACESWAP_SWAPPER_URL").unwrap_or(defaults.swapper_url),
            bind_addr: lookup("FACESWAP_BIND").unwrap_or(defaults.bind_addr),
            max_upload_bytes: parse_var(&lookup, "FACESWAP_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            result_retention_secs: parse_var(
                &lookup,
                "FACESWAP_RESULT_RETENTION_SECS",
                defaults.result_retention_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface mid-request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::Missing("model name"));
        }
        let (w, h) = self.det_size;
        if w == 0 || h == 0 || w % DET_SIZE_ALIGNMENT != 0 || h % DET_SIZE_ALIGNMENT != 0 {
            return Err(ConfigError::InvalidDetSize(w, h));
        }
        self.result_directory()?;
        if self.upload_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("upload directory"));
        }
        Ok(())
    }

    /// Directory containing the face analysis model pack.
    pub fn model_dir(&self) -> PathBuf {
        self.model_root.join(&self.model_name)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir().join(DETECTOR_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir().join(RECOGNIZER_FILE)
    }

    /// `<output_dir>/<result_dir>`, or an error if either part is empty.
    pub fn result_directory(&self) -> Result<PathBuf, ConfigError> {
        if self.output_dir.as_os_str().is_empty() || self.result_dir.trim().is_empty() {
            return Err(ConfigError::Missing("output directory or result image directory"));
        }
        Ok(self.output_dir.join(&self.result_dir))
    }
}

/// Default insightface model cache: `$HOME/.insightface/models`.
pub fn default_model_root() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    Path::new(&home).join(".insightface").join("models")
}

/// Parse "640x640", "640,640" or a single "640".
fn parse_det_size(value: &str) -> Option<(u32, u32)> {
    let value = value.trim();
    let mut parts = value.split(|c| c == 'x' || c == 'X' || c == ',');
    let w: u32 = parts.next()?.trim().parse().ok()?;
    let h: u32 = match parts.next() {
        Some(h) => h.trim().parse().ok()?,
        None => w,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((w, h))
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        None => Ok(default),
    }
}
