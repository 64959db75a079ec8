//! Blink-based liveness detection.
//!
//! A printed photo held to the camera never blinks. The monitor watches a
//! stream of frames for an eyes-absent → eyes-present transition and counts
//! it as one blink.
//!
//! State is a plain value owned by the caller, one per check session, so
//! concurrent users never share counters.
//!
//! # Limitations
//!
//! - Losing track of the face looks exactly like closed eyes. There is no
//!   timeout that returns a session from `Closed` to `Open`.
//! - A replayed video of a blinking face passes.

use crate::detector::FaceLocator;
use crate::extractor::ExtractError;
use crate::frame::Frame;
use crate::types::BoundingBox;
use image::GrayImage;
use std::time::{Duration, SystemTime};

/// Eye patch side as a fraction of the inter-ocular distance.
const EYE_PATCH_FRACTION: f32 = 0.35;
const EYE_PATCH_MIN_SIDE: f32 = 5.0;
/// Minimum luma standard deviation for a patch to contain an open eye.
/// Iris against sclera gives strong contrast; a closed lid is mostly skin.
const DEFAULT_EYE_MIN_STDDEV: f32 = 18.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EyeState {
    #[default]
    Open,
    Closed,
}

/// Per-session blink tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LivenessState {
    pub eyes: EyeState,
    pub blink_count: u32,
    pub last_blink: Option<SystemTime>,
}

impl LivenessState {
    /// True when a blink was observed no longer than `window` before `now`.
    pub fn blinked_within(&self, window: Duration, now: SystemTime) -> bool {
        match self.last_blink {
            Some(at) => now.duration_since(at).map(|age| age <= window).unwrap_or(true),
            None => false,
        }
    }
}

/// Advance the state machine by one frame.
///
/// | state  | eyes | next   | blink |
/// |--------|------|--------|-------|
/// | Open   | yes  | Open   | no    |
/// | Open   | no   | Closed | no    |
/// | Closed | yes  | Open   | yes   |
/// | Closed | no   | Closed | no    |
pub fn step(state: LivenessState, eyes_detected: bool, now: SystemTime) -> (LivenessState, bool) {
    match (state.eyes, eyes_detected) {
        (EyeState::Open, true) | (EyeState::Closed, false) => (state, false),
        (EyeState::Open, false) => (
            LivenessState {
                eyes: EyeState::Closed,
                ..state
            },
            false,
        ),
        (EyeState::Closed, true) => (
            LivenessState {
                eyes: EyeState::Open,
                blink_count: state.blink_count.saturating_add(1),
                last_blink: Some(now),
            },
            true,
        ),
    }
}

/// Zero the blink counter. The eye state and last blink time are kept.
pub fn reset(state: LivenessState) -> LivenessState {
    LivenessState {
        blink_count: 0,
        ..state
    }
}

/// Eye region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Finds visible (open) eyes inside one detected face.
pub trait EyeDetector {
    fn detect_eyes(&self, luma: &GrayImage, face: &BoundingBox) -> Vec<EyeRegion>;
}

/// Appearance check on patches centred on the detector's eye landmarks.
///
/// Works on the luma plane only and shares nothing with the embedding
/// model.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkEyeDetector {
    pub min_stddev: f32,
}

impl Default for LandmarkEyeDetector {
    fn default() -> Self {
        Self {
            min_stddev: DEFAULT_EYE_MIN_STDDEV,
        }
    }
}

impl EyeDetector for LandmarkEyeDetector {
    fn detect_eyes(&self, luma: &GrayImage, face: &BoundingBox) -> Vec<EyeRegion> {
        let Some(landmarks) = face.landmarks.as_ref() else {
            return Vec::new();
        };
        let (left, right) = (landmarks[0], landmarks[1]);
        let iod = ((right.0 - left.0).powi(2) + (right.1 - left.1).powi(2)).sqrt();
        let side = (iod * EYE_PATCH_FRACTION).max(EYE_PATCH_MIN_SIDE);

        [left, right]
            .into_iter()
            .filter_map(|center| eye_patch(luma, center, side))
            .filter(|region| patch_stddev(luma, region) >= self.min_stddev)
            .collect()
    }
}

/// Square patch of `side` pixels around `center`, clipped to the image.
fn eye_patch(luma: &GrayImage, center: (f32, f32), side: f32) -> Option<EyeRegion> {
    let half = side / 2.0;
    let x0 = (center.0 - half).max(0.0).floor() as u32;
    let y0 = (center.1 - half).max(0.0).floor() as u32;
    let x1 = ((center.0 + half).ceil().max(0.0) as u32).min(luma.width());
    let y1 = ((center.1 + half).ceil().max(0.0) as u32).min(luma.height());
    if x1 <= x0 + 1 || y1 <= y0 + 1 {
        return None;
    }
    Some(EyeRegion {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

fn patch_stddev(luma: &GrayImage, region: &EyeRegion) -> f32 {
    let mut sum = 0.0f32;
    let mut sum_sq = 0.0f32;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            let v = luma.get_pixel(x, y).0[0] as f32;
            sum += v;
            sum_sq += v * v;
        }
    }
    let n = (region.width * region.height) as f32;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

/// True iff some detected face shows at least one eye.
///
/// Faces are tried in detector order; the first with an eye wins.
pub fn eyes_detected<L, D>(frame: &Frame, locator: &mut L, eye_detector: &D) -> Result<bool, ExtractError>
where
    L: FaceLocator + ?Sized,
    D: EyeDetector + ?Sized,
{
    let faces = locator.locate(frame)?;
    let found = faces
        .iter()
        .any(|face| !eye_detector.detect_eyes(&frame.luma, face).is_empty());
    tracing::trace!(faces = faces.len(), eyes = found, "liveness eye check");
    Ok(found)
}

/// Check one frame and advance `state`. Returns the new state and whether
/// this frame completed a blink.
pub fn liveness_step<L, D>(
    frame: &Frame,
    state: LivenessState,
    locator: &mut L,
    eye_detector: &D,
) -> Result<(LivenessState, bool), ExtractError>
where
    L: FaceLocator + ?Sized,
    D: EyeDetector + ?Sized,
{
    let eyes = eyes_detected(frame, locator, eye_detector)?;
    Ok(step(state, eyes, SystemTime::now()))
}
