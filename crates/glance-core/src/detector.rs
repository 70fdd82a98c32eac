//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD model over a decoded grayscale frame: letterbox resize to
//! the model input square, 3-stride anchor-free decoding, NMS, and a final
//! confidence sort.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// 3 strides × (score, bbox, kps) tensors, in standard SCRFD export order.
const EXPECTED_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding of the letterbox resize, used to map detections back
/// into original-image coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    resized_w: u32,
    resized_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let resized_w = (width as f32 * scale).round() as u32;
        let resized_h = (height as f32 * scale).round() as u32;
        Self {
            scale,
            pad_x: (target - resized_w) as f32 / 2.0,
            pad_y: (target - resized_h) as f32 / 2.0,
            resized_w,
            resized_h,
        }
    }

    fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let num_outputs = session.outputs().len();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SCRFD model"
        );

        if num_outputs < EXPECTED_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires {EXPECTED_OUTPUTS} outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        Ok(Self { session })
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Returns zero or more face boxes in original-image coordinates, sorted
    /// by descending confidence. An empty result is a normal outcome, not an
    /// error.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Standard SCRFD export order: [0-2] scores, [3-5] bboxes, [6-8] kps,
        // each group over strides 8/16/32.
        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[slot]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[slot + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[slot + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_IOU_THRESHOLD))
    }
}

/// Letterbox a grayscale frame into the NCHW input tensor.
///
/// A zero-initialized tensor already encodes the padding: a pixel at
/// PIXEL_MEAN normalizes to 0.0.
fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_SIZE);
    let resized = imageops::resize(
        image,
        letterbox.resized_w.max(1),
        letterbox.resized_h.max(1),
        FilterType::Triangle,
    );

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let x_off = letterbox.pad_x.floor() as usize;
    let y_off = letterbox.pad_y.floor() as usize;

    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (tx, ty) = (x as usize + x_off, y as usize + y_off);
        if tx >= size || ty >= size {
            continue;
        }
        // The model expects three channels; replicate luma into each.
        tensor[[0, 0, ty, tx]] = v;
        tensor[[0, 1, ty, tx]] = v;
        tensor[[0, 2, ty, tx]] = v;
    }

    (tensor, letterbox)
}

/// Decode one stride level into face boxes in original-image coordinates.
///
/// SCRFD regresses per-anchor distances to the box edges and landmark
/// offsets, all in units of the stride.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceBox> {
    let grid = INPUT_SIZE as usize / stride;
    let anchors = grid * grid * ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut found = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= CONFIDENCE_THRESHOLD {
            continue;
        }
        if boxes.len() < (idx + 1) * 4 {
            break;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_x = ((cell % grid) * stride) as f32;
        let anchor_y = ((cell / grid) * stride) as f32;

        let b = &boxes[idx * 4..idx * 4 + 4];
        let (x1, y1) = letterbox.to_original(anchor_x - b[0] * s, anchor_y - b[1] * s);
        let (x2, y2) = letterbox.to_original(anchor_x + b[2] * s, anchor_y + b[3] * s);

        let landmarks = if kps.len() >= (idx + 1) * 10 {
            let k = &kps[idx * 10..idx * 10 + 10];
            let mut points = [(0.0f32, 0.0f32); 5];
            for (i, point) in points.iter_mut().enumerate() {
                *point = letterbox.to_original(anchor_x + k[i * 2] * s, anchor_y + k[i * 2 + 1] * s);
            }
            Some(points)
        } else {
            None
        };

        found.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    found
}

/// Non-maximum suppression. Returns the survivors sorted by descending confidence.
fn nms(mut candidates: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union of two face boxes.
fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
