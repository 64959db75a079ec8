//! votegate-core: Face identity verification for face-gated voting.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running
//! via ONNX Runtime for CPU inference. On top of the extractor sit the
//! cosine matcher, enrollment deduplication and a blink liveness monitor.

pub mod alignment;
pub mod codec;
pub mod detector;
pub mod extractor;
pub mod frame;
pub mod gallery;
pub mod gate;
pub mod guard;
pub mod liveness;
pub mod recognizer;
pub mod types;

pub use detector::{FaceDetector, FaceLocator};
pub use extractor::{EmbeddingExtractor, ExtractError, FaceEmbedder, LoadError};
pub use frame::{decode_frame, Frame, FrameError};
pub use gallery::{GalleryEntry, GallerySnapshot};
pub use gate::{Gate, GateError, VerifyOutcome};
pub use guard::EnrollmentGuard;
pub use liveness::{EyeDetector, EyeState, LandmarkEyeDetector, LivenessState};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, MatchResult, Matcher};
