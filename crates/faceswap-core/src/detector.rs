//! SCRFD face detector via ONNX Runtime.
//!
//! The frame is scaled to fit the detector input (anchored top-left, black
//! padded), decoded per stride level from anchor-relative distances, mapped
//! back to frame coordinates and filtered with NMS.

use crate::session::{build_session, ExecutionDevice};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUT_COUNT: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output positions of one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_width: usize,
    input_height: usize,
    levels: [LevelOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model for a `det_size` (width, height) input.
    pub fn load(model_path: &Path, device: ExecutionDevice, det_size: (u32, u32)) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = build_session(model_path, device)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < SCRFD_OUTPUT_COUNT {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs {SCRFD_OUTPUT_COUNT} outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }

        let levels = map_outputs(&names);
        tracing::debug!(?levels, "SCRFD output mapping");

        Ok(Self {
            session,
            input_width: det_size.0 as usize,
            input_height: det_size.1 as usize,
            levels,
        })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, det_scale) = prepare_input(frame, self.input_width, self.input_height);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in self.levels.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |index: usize, what: &'static str| {
                outputs[index]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(level.score, "scores")?;
            let distances = extract(level.bbox, "bboxes")?;
            let keypoints = extract(level.kps, "kps")?;

            let grid = (self.input_width / stride, self.input_height / stride);
            candidates.extend(
                decode_level(scores, distances, keypoints, stride, grid, SCRFD_SCORE_THRESHOLD)
                    .into_iter()
                    .map(|b| rescale(b, det_scale)),
            );
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection done");
        Ok(faces)
    }
}

/// Resize `frame` to fit `width`×`height` keeping aspect ratio, place it at the
/// top-left of a black canvas and normalize to NCHW. Returns the tensor and
/// the scale from frame to input coordinates.
fn prepare_input(frame: &RgbImage, width: usize, height: usize) -> (Array4<f32>, f32) {
    let image_ratio = frame.height() as f32 / frame.width() as f32;
    let model_ratio = height as f32 / width as f32;
    let (new_w, new_h) = if image_ratio > model_ratio {
        (((height as f32 / image_ratio) as usize).max(1), height)
    } else {
        (width, ((width as f32 * image_ratio) as usize).max(1))
    };
    let det_scale = new_h as f32 / frame.height() as f32;

    let resized = imageops::resize(frame, new_w as u32, new_h as u32, FilterType::Triangle);

    // Canvas is black pixels, normalized like the image.
    let mut tensor = Array4::<f32>::from_elem((1, 3, height, width), -SCRFD_MEAN / SCRFD_STD);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (value as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, det_scale)
}

/// Map output names to stride levels.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, … or use
/// numeric names, in which case the standard order is assumed: scores for
/// strides 8/16/32, then bboxes, then keypoints.
fn map_outputs(names: &[String]) -> [LevelOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |stride: usize| -> Option<LevelOutputs> {
        Some(LevelOutputs {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    match (named(8), named(16), named(32)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::info!(?names, "SCRFD outputs unnamed, using positional order");
            [0, 1, 2].map(|i| LevelOutputs { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Decode one stride level into boxes in detector-input coordinates.
///
/// `grid` is (columns, rows). Each cell carries two anchors sharing the cell's
/// top-left corner as center; distances and keypoint offsets are in stride units.
fn decode_level(
    scores: &[f32],
    distances: &[f32],
    keypoints: &[f32],
    stride: usize,
    grid: (usize, usize),
    threshold: f32,
) -> Vec<BoundingBox> {
    let (cols, rows) = grid;
    let step = stride as f32;
    let anchors = cols * rows * SCRFD_ANCHORS_PER_CELL;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] >= threshold)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let (ax, ay) = ((cell % cols) as f32 * step, (cell / cols) as f32 * step);

            let d = distances.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = (ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = (ax + d[2] * step, ay + d[3] * step);

            let landmarks = keypoints.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| (ax + k[2 * p] * step, ay + k[2 * p + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Map a box from detector-input to frame coordinates.
fn rescale(mut b: BoundingBox, det_scale: f32) -> BoundingBox {
    b.x /= det_scale;
    b.y /= det_scale;
    b.width /= det_scale;
    b.height /= det_scale;
    if let Some(lms) = b.landmarks.as_mut() {
        for (x, y) in lms.iter_mut() {
            *x /= det_scale;
            *y /= det_scale;
        }
    }
    b
}

/// Greedy non-maximum suppression. Output is sorted by confidence, descending.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| overlap(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union in pixel-inclusive coordinates (+1 on each side).
fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area = |r: &BoundingBox| (r.width + 1.0) * (r.height + 1.0);
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x) + 1.0).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y) + 1.0).max(0.0);
    let inter = iw * ih;
    let union = area(a) + area(b) - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
