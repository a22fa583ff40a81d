//! Face swap executor: detect in both images, swap the first source identity
//! onto every target face, persist the result as JPEG.

use crate::analysis::{AnalysisError, FaceAnalyzer, IdentitySwapper};
use crate::artifact::SwapperModelArtifact;
use crate::color;
use crate::config::{Config, ConfigError};
use crate::swapper::SwapperError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const RESULT_JPEG_QUALITY: u8 = 95;
const RESULT_PREFIX: &str = "swapped_face";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Which of the two request images an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// The target image whose faces get replaced.
    MultiFace,
    /// The image providing the identity.
    SingleFace,
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::MultiFace => f.write_str("multi-face"),
            ImageRole::SingleFace => f.write_str("single-face"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Swapper model not found at: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("No faces detected in the {0} image!")]
    NoFacesDetected(ImageRole),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to decode {role} image: {source}")]
    Decode {
        role: ImageRole,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to encode result image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("face swap failed: {0}")]
    Swapper(#[source] SwapperError),
}

impl From<SwapperError> for SwapError {
    fn from(err: SwapperError) -> Self {
        match err {
            SwapperError::ModelNotFound(path) => SwapError::ModelNotFound(path),
            other => SwapError::Swapper(other),
        }
    }
}

impl SwapError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        SwapError::Io { context: context.into(), source }
    }
}

/// Owns the loaded models and runs swaps one at a time.
pub struct FaceSwapExecutor<A, S> {
    config: Config,
    analyzer: A,
    swapper: S,
}

impl<A: FaceAnalyzer, S: IdentitySwapper> FaceSwapExecutor<A, S> {
    pub fn new(config: Config, analyzer: A, swapper: S) -> Self {
        Self { config, analyzer, swapper }
    }

    /// Swap faces between two image files on disk.
    ///
    /// The swapper weights are checked before either file is read.
    pub fn swap_files(&mut self, target: &Path, source: &Path) -> Result<SwapperModelArtifact, SwapError> {
        self.swapper.prepare()?;
        let target_image = decode(target, ImageRole::MultiFace)?;
        let source_image = decode(source, ImageRole::SingleFace)?;
        self.swap_images(&target_image, &source_image)
    }

    /// Swap the identity of the first face in `source` onto every face in `target`.
    pub fn swap_images(
        &mut self,
        target: &DynamicImage,
        source: &DynamicImage,
    ) -> Result<SwapperModelArtifact, SwapError> {
        self.swapper.prepare()?;

        let target_frame = color::to_model_frame(target);
        let source_frame = color::to_model_frame(source);

        let target_faces = self.analyzer.analyze(&target_frame)?;
        let source_faces = self.analyzer.analyze(&source_frame)?;
        tracing::info!(
            target_faces = target_faces.len(),
            source_faces = source_faces.len(),
            "face detection complete"
        );

        if target_faces.is_empty() {
            tracing::warn!("no faces detected in the multi-face image");
            return Err(SwapError::NoFacesDetected(ImageRole::MultiFace));
        }
        let Some(source_face) = source_faces.first() else {
            tracing::warn!("no faces detected in the single-face image");
            return Err(SwapError::NoFacesDetected(ImageRole::SingleFace));
        };

        // Each swap runs on the previous output.
        let mut result = target_frame;
        for (i, face) in target_faces.iter().enumerate() {
            result = self.swapper.swap(&result, face, source_face)?;
            tracing::debug!(face = i, confidence = face.bbox.confidence, "face swapped");
        }

        let persisted = color::from_model_frame(result);
        let result_dir = self.config.result_directory()?;
        std::fs::create_dir_all(&result_dir)
            .map_err(|e| SwapError::io(format!("failed to create {}", result_dir.display()), e))?;

        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let path = write_result(&result_dir, &stamp, &persisted)?;
        tracing::info!(path = %path.display(), faces = target_faces.len(), "swapped result written");

        Ok(SwapperModelArtifact { result_image_path: path })
    }
}

fn decode(path: &Path, role: ImageRole) -> Result<DynamicImage, SwapError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| SwapError::io(format!("failed to read {}", path.display()), e))?;
    reader.decode().map_err(|source| SwapError::Decode { role, source })
}

/// Write `image` as JPEG under the first free `swapped_face_<stamp>[_n].jpg` name.
fn write_result(dir: &Path, stamp: &str, image: &DynamicImage) -> Result<PathBuf, SwapError> {
    let (path, file) = claim_result_path(dir, stamp)
        .map_err(|e| SwapError::io(format!("failed to create result in {}", dir.display()), e))?;

    if let Err(e) = encode_jpeg(file, image) {
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }
    Ok(path)
}

/// Encode `image` as JPEG into `sink`, surfacing errors from the final flush.
fn encode_jpeg<W: Write>(sink: W, image: &DynamicImage) -> Result<(), SwapError> {
    let mut writer = BufWriter::new(sink);
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, RESULT_JPEG_QUALITY))
        .map_err(SwapError::Encode)?;
    writer
        .into_inner()
        .map_err(|e| SwapError::io("failed to flush result image", e.into_error()))?;
    Ok(())
}

fn claim_result_path(dir: &Path, stamp: &str) -> io::Result<(PathBuf, std::fs::File)> {
    let mut n = 0u32;
    loop {
        let name = if n == 0 {
            format!("{RESULT_PREFIX}_{stamp}.jpg")
        } else {
            format!("{RESULT_PREFIX}_{stamp}_{n}.jpg")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding, Face};
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    fn face(x: f32, y: f32, identity: f32) -> Face {
        Face {
            bbox: BoundingBox {
                x,
                y,
                width: 40.0,
                height: 40.0,
                confidence: 0.9,
                landmarks: Some([(0.0, 0.0); 5]),
            },
            embedding: Some(Embedding { values: vec![identity], model_version: None }),
        }
    }

    /// Returns queued face lists, one per `analyze` call.
    struct FakeAnalyzer {
        responses: VecDeque<Vec<Face>>,
        calls: usize,
    }

    impl FakeAnalyzer {
        fn new(target: Vec<Face>, source: Vec<Face>) -> Self {
            Self { responses: VecDeque::from([target, source]), calls: 0 }
        }
    }

    impl FaceAnalyzer for FakeAnalyzer {
        fn analyze(&mut self, _frame: &RgbImage) -> Result<Vec<Face>, AnalysisError> {
            self.calls += 1;
            Ok(self.responses.pop_front().unwrap_or_default())
        }
    }

    /// Paints the target box with a gray level taken from the source identity.
    struct FakeSwapper {
        model_path: Option<PathBuf>,
        identities: Vec<f32>,
    }

    impl FakeSwapper {
        fn ready() -> Self {
            Self { model_path: None, identities: Vec::new() }
        }
    }

    impl IdentitySwapper for FakeSwapper {
        fn prepare(&mut self) -> Result<(), SwapperError> {
            match &self.model_path {
                Some(path) => Err(SwapperError::ModelNotFound(path.clone())),
                None => Ok(()),
            }
        }

        fn swap(&mut self, frame: &RgbImage, target: &Face, source: &Face) -> Result<RgbImage, SwapperError> {
            let identity = source.embedding.as_ref().ok_or(SwapperError::NoEmbedding)?.values[0];
            self.identities.push(identity);
            let mut out = frame.clone();
            let b = &target.bbox;
            for y in b.y as u32..(b.y + b.height) as u32 {
                for x in b.x as u32..(b.x + b.width) as u32 {
                    out.put_pixel(x, y, Rgb([identity as u8; 3]));
                }
            }
            Ok(out)
        }
    }

    fn config_in(dir: &Path) -> Config {
        Config { output_dir: dir.to_path_buf(), ..Config::default() }
    }

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([20, 20, 20])))
    }

    fn result_files(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir.join("results")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_swaps_every_target_face() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = FakeAnalyzer::new(vec![face(10.0, 10.0, 0.0), face(70.0, 70.0, 0.0)], vec![face(0.0, 0.0, 200.0)]);
        let mut executor = FaceSwapExecutor::new(config_in(dir.path()), analyzer, FakeSwapper::ready());

        let artifact = executor.swap_images(&blank(128, 128), &blank(64, 64)).unwrap();

        let name = artifact.file_name();
        assert!(name.starts_with("swapped_face_") && name.ends_with(".jpg"), "{name}");
        let out = image::open(&artifact.result_image_path).unwrap().to_rgb8();
        for (x, y) in [(30, 30), (90, 90)] {
            let v = out.get_pixel(x, y)[0];
            assert!((v as i32 - 200).abs() < 12, "face at ({x},{y}) not replaced: {v}");
        }
        assert!((out.get_pixel(120, 5)[0] as i32 - 20).abs() < 12);
        assert_eq!(executor.swapper.identities, vec![200.0, 200.0]);
    }

    #[test]
    fn test_only_first_source_face_used() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = FakeAnalyzer::new(
            vec![face(10.0, 10.0, 0.0)],
            vec![face(0.0, 0.0, 150.0), face(50.0, 0.0, 60.0)],
        );
        let mut executor = FaceSwapExecutor::new(config_in(dir.path()), analyzer, FakeSwapper::ready());

        executor.swap_images(&blank(64, 64), &blank(64, 64)).unwrap();
        assert_eq!(executor.swapper.identities, vec![150.0]);
    }

    #[test]
    fn test_no_target_faces() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = FakeAnalyzer::new(vec![], vec![face(0.0, 0.0, 1.0)]);
        let mut executor = FaceSwapExecutor::new(config_in(dir.path()), analyzer, FakeSwapper::ready());

        let err = executor.swap_images(&blank(64, 64), &blank(64, 64)).unwrap_err();
        assert!(matches!(err, SwapError::NoFacesDetected(ImageRole::MultiFace)));
        assert_eq!(err.to_string(), "No faces detected in the multi-face image!");
        assert!(result_files(dir.path()).is_empty());
    }

    #[test]
    fn test_no_source_faces() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = FakeAnalyzer::new(vec![face(0.0, 0.0, 1.0)], vec![]);
        let mut executor = FaceSwapExecutor::new(config_in(dir.path()), analyzer, FakeSwapper::ready());

        let err = executor.swap_images(&blank(64, 64), &blank(64, 64)).unwrap_err();
        assert_eq!(err.to_string(), "No faces detected in the single-face image!");
        assert!(executor.swapper.identities.is_empty());
        assert!(result_files(dir.path()).is_empty());
    }

    #[test]
    fn test_model_not_found_before_reading_images() {
        let dir = tempfile::tempdir().unwrap();
        let swapper = FakeSwapper {
            model_path: Some(PathBuf::from("weights/inswapper_128.onnx")),
            identities: Vec::new(),
        };
        let mut executor = FaceSwapExecutor::new(
            config_in(dir.path()),
            FakeAnalyzer::new(vec![], vec![]),
            swapper,
        );

        let err = executor
            .swap_files(Path::new("/nonexistent/a.jpg"), Path::new("/nonexistent/b.jpg"))
            .unwrap_err();
        assert!(matches!(err, SwapError::ModelNotFound(_)));
        assert_eq!(err.to_string(), "Swapper model not found at: weights/inswapper_128.onnx");
        assert_eq!(executor.analyzer.calls, 0);
    }

    #[test]
    fn test_swap_files_decodes_by_content() {
        let dir = tempfile::tempdir().unwrap();
        // PNG bytes under a .jpg name, as uploads are named.
        let target = dir.path().join("multi_upload.jpg");
        let source = dir.path().join("single_upload.jpg");
        blank(64, 64).save_with_format(&target, image::ImageFormat::Png).unwrap();
        blank(32, 32).save_with_format(&source, image::ImageFormat::Png).unwrap();

        let analyzer = FakeAnalyzer::new(vec![face(5.0, 5.0, 0.0)], vec![face(0.0, 0.0, 90.0)]);
        let mut executor = FaceSwapExecutor::new(config_in(dir.path()), analyzer, FakeSwapper::ready());

        let artifact = executor.swap_files(&target, &source).unwrap();
        assert!(artifact.result_image_path.exists());
    }

    #[test]
    fn test_undecodable_upload() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("multi.jpg");
        std::fs::write(&target, b"definitely not an image").unwrap();

        let mut executor = FaceSwapExecutor::new(
            config_in(dir.path()),
            FakeAnalyzer::new(vec![], vec![]),
            FakeSwapper::ready(),
        );
        let err = executor.swap_files(&target, &target).unwrap_err();
        assert!(matches!(err, SwapError::Decode { role: ImageRole::MultiFace, .. }));
    }

    #[test]
    fn test_same_second_results_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let image = blank(16, 16);

        let first = write_result(dir.path(), "20240101_120000", &image).unwrap();
        let second = write_result(dir.path(), "20240101_120000", &image).unwrap();
        let third = write_result(dir.path(), "20240101_120000", &image).unwrap();

        assert_eq!(first.file_name().unwrap(), "swapped_face_20240101_120000.jpg");
        assert_eq!(second.file_name().unwrap(), "swapped_face_20240101_120000_1.jpg");
        assert_eq!(third.file_name().unwrap(), "swapped_face_20240101_120000_2.jpg");
        assert!(image::open(&second).is_ok());
    }

    /// Accepts `budget` bytes, then fails every write like a full disk.
    struct ShortWriter {
        budget: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_truncated_write_is_an_error() {
        // Small enough to sit entirely in the write buffer until the final flush.
        let err = encode_jpeg(ShortWriter { budget: 64 }, &blank(16, 16)).unwrap_err();
        assert!(matches!(err, SwapError::Io { .. } | SwapError::Encode(_)), "{err}");
    }

    #[test]
    fn test_encode_jpeg_complete_write() {
        let mut out = Vec::new();
        encode_jpeg(&mut out, &blank(16, 16)).unwrap();
        let decoded = image::load_from_memory_with_format(&out, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn test_empty_result_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { result_dir: String::new(), ..config_in(dir.path()) };
        let analyzer = FakeAnalyzer::new(vec![face(0.0, 0.0, 0.0)], vec![face(0.0, 0.0, 10.0)]);
        let mut executor = FaceSwapExecutor::new(config, analyzer, FakeSwapper::ready());

        let err = executor.swap_images(&blank(64, 64), &blank(64, 64)).unwrap_err();
        assert!(matches!(err, SwapError::Config(_)));
    }
}
