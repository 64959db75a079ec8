//! Embedding extraction: frame in, one face embedding out.
//!
//! Extraction failures are split into "no usable face" and "pipeline
//! failure" so callers can ask for a retake instead of denying access.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::{Frame, FrameError};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_DISTANCE_THRESHOLD, ARCFACE_MODEL_ID};
use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl From<DetectorError> for ExtractError {
    fn from(err: DetectorError) -> Self {
        ExtractError::Extraction(format!("detector: {err}"))
    }
}

impl From<RecognizerError> for ExtractError {
    fn from(err: RecognizerError) -> Self {
        ExtractError::Extraction(format!("recognizer: {err}"))
    }
}

impl From<FrameError> for ExtractError {
    fn from(err: FrameError) -> Self {
        ExtractError::Extraction(format!("frame: {err}"))
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Converts a frame into a fixed-length embedding.
///
/// The decision threshold is a property of the model, so it travels with
/// the extractor.
pub trait EmbeddingExtractor {
    fn model_id(&self) -> &str;
    fn default_threshold(&self) -> f32;
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError>;
}

/// SCRFD detection followed by ArcFace recognition of the most confident face.
pub struct FaceEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceEmbedder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, LoadError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// The face detector, shared with liveness probing.
    pub fn locator(&mut self) -> &mut FaceDetector {
        &mut self.detector
    }
}

impl EmbeddingExtractor for FaceEmbedder {
    fn model_id(&self) -> &str {
        ARCFACE_MODEL_ID
    }

    fn default_threshold(&self) -> f32 {
        ARCFACE_DISTANCE_THRESHOLD
    }

    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError> {
        if frame.is_dark() {
            tracing::debug!(
                brightness = frame.avg_brightness(),
                "frame too dark for detection"
            );
            return Err(ExtractError::NoFaceDetected);
        }

        let faces = self.detector.detect(frame)?;
        let face = faces.first().ok_or(ExtractError::NoFaceDetected)?;
        tracing::debug!(
            faces = faces.len(),
            confidence = face.confidence,
            "extracting embedding for most confident face"
        );

        Ok(self.recognizer.extract(frame, face)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_landmarks_is_extraction_error() {
        let err: ExtractError = RecognizerError::NoLandmarks.into();
        assert!(matches!(err, ExtractError::Extraction(_)));
    }

    #[test]
    fn test_detector_failure_is_extraction_error() {
        let err: ExtractError = DetectorError::InferenceFailed("boom".into()).into();
        assert!(matches!(err, ExtractError::Extraction(msg) if msg.contains("boom")));
    }

    #[test]
    fn test_frame_failure_is_extraction_error() {
        let err: ExtractError = FrameError::Empty.into();
        assert!(matches!(err, ExtractError::Extraction(_)));
    }

    #[test]
    fn test_missing_model_fails_fast() {
        let result = FaceEmbedder::load("/nonexistent/det.onnx", "/nonexistent/rec.onnx");
        assert!(matches!(
            result,
            Err(LoadError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
