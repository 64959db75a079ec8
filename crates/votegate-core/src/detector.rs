//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.

use crate::frame::Frame;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

/// Anything that can locate faces in a frame.
pub trait FaceLocator {
    /// Detected faces, highest confidence first.
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError>;
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

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Detect faces in an RGB frame, returning bounding boxes sorted by confidence.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(&frame.rgb, self.input_width, self.input_height);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            let dets = decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            );
            all_detections.extend(dets);
        }

        let mut result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::trace!(faces = result.len(), "SCRFD detection finished");
        Ok(result)
    }
}

impl FaceLocator for FaceDetector {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect(frame)
    }
}

/// Letterbox an RGB image into a NCHW float tensor of the given input size.
///
/// Resizes with bilinear (triangle) filtering, centres the result and pads
/// with SCRFD_MEAN so the padding normalizes to 0.0.
fn letterbox_tensor(
    rgb: &RgbImage,
    input_width: usize,
    input_height: usize,
) -> (Array4<f32>, LetterboxInfo) {
    let width = rgb.width() as usize;
    let height = rgb.height() as usize;

    let scale_w = input_width as f32 / width as f32;
    let scale_h = input_height as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_width);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_height);
    let pad_x = (input_width - new_w) as f32 / 2.0;
    let pad_y = (input_height - new_h) as f32 / 2.0;

    let letterbox = LetterboxInfo { scale, pad_x, pad_y };

    let resized = imageops::resize(rgb, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Start from the normalized pad value, then paint the resized image in.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_height, input_width));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = pad_x_start + x as usize;
        let ty = pad_y_start + y as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If named pattern is detected, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    // Try name-based discovery: look for "score_8", "bbox_8", "kps_8" patterns.
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let mut named = [(0usize, 0usize, 0usize); 3];
    let mut all_named = true;
    for (slot, &stride) in named.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => *slot = (s, b, k),
            _ => {
                all_named = false;
                break;
            }
        }
    }

    if all_named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        named
    } else {
        tracing::info!(
            ?names,
            "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
        );
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// Decode detections for a single stride level.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let cy = (anchor_idx / grid_w) as f32;
        let cx = (anchor_idx % grid_w) as f32;

        let anchor_cx = cx * stride as f32;
        let anchor_cy = cy * stride as f32;

        // Decode bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[bbox_off] * stride as f32;
        let y1 = anchor_cy - bboxes[bbox_off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[bbox_off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[bbox_off + 3] * stride as f32;

        // Map from letterboxed space to original frame space
        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        // Decode landmarks
        let kps_off = idx * 10;
        let landmarks = if kps_off + 9 < kps.len() {
            let mut lms = [(0.0f32, 0.0f32); 5];
            for i in 0..5 {
                let lx = anchor_cx + kps[kps_off + i * 2] * stride as f32;
                let ly = anchor_cy + kps[kps_off + i * 2 + 1] * stride as f32;
                lms[i] = (
                    (lx - letterbox.pad_x) / letterbox.scale,
                    (ly - letterbox.pad_y) / letterbox.scale,
                );
            }
            Some(lms)
        } else {
            None
        };

        detections.push(BoundingBox {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = a.width * a.height;
    let area_b = b.width * b.height;
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        let expected = 50.0 / 150.0;
        assert!((iou(&a, &b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_no_suppression() {
        let detections = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        let result = nms(vec![], 0.4);
        assert!(result.is_empty());
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let width = 320.0f32;
        let height = 240.0f32;
        let scale_w = 640.0 / width;
        let scale_h = 640.0 / height;
        let scale = scale_w.min(scale_h);
        let new_w = (width * scale).round();
        let new_h = (height * scale).round();
        let pad_x = (640.0 - new_w) / 2.0;
        let pad_y = (640.0 - new_h) / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        let orig_x = 100.0f32;
        let orig_y = 50.0f32;
        let letterboxed_x = orig_x * scale + pad_x;
        let letterboxed_y = orig_y * scale + pad_y;

        let recovered_x = (letterboxed_x - letterbox.pad_x) / letterbox.scale;
        let recovered_y = (letterboxed_y - letterbox.pad_y) / letterbox.scale;

        assert!((recovered_x - orig_x).abs() < 0.1, "x: {recovered_x} vs {orig_x}");
        assert!((recovered_y - orig_y).abs() < 0.1, "y: {recovered_y} vs {orig_y}");
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);

        // stride 8: score at 0, bbox at 3, kps at 6
        assert_eq!(indices[0], (0, 3, 6));
        // stride 16: score at 1, bbox at 4, kps at 7
        assert_eq!(indices[1], (1, 4, 7));
        // stride 32: score at 2, bbox at 5, kps at 8
        assert_eq!(indices[2], (2, 5, 8));
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        // Named but in non-standard order
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);

        // score_8 at index 2, bbox_8 at 0, kps_8 at 1
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        // Generic numeric names should fall back to positional
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_letterbox_tensor_shape_and_padding() {
        // Wide image: letterboxed vertically
        let rgb = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 128]));
        let (tensor, lb) = letterbox_tensor(&rgb, 64, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert!((lb.pad_y - 16.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);

        // Padding rows normalize to 0.0
        assert_eq!(tensor[[0, 0, 0, 10]], 0.0);
        assert_eq!(tensor[[0, 2, 63, 10]], 0.0);

        // Image rows carry the per-channel values
        let r = tensor[[0, 0, 32, 10]];
        let g = tensor[[0, 1, 32, 10]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-4, "r = {r}");
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-4, "g = {g}");
    }

    #[test]
    fn test_letterbox_tensor_upscales_small_frames() {
        let rgb = RgbImage::from_pixel(10, 10, image::Rgb([128, 128, 128]));
        let (tensor, lb) = letterbox_tensor(&rgb, 40, 40);
        assert!((lb.scale - 4.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 0.0);
        let expected = (128.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 1, 39, 39]] - expected).abs() < 1e-4);
    }
}
