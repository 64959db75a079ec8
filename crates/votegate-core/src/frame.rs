//! Frame type and decoding: encoded bytes to RGB plus a luma plane, dark detection.

use image::{GrayImage, RgbImage};
use thiserror::Error;

/// Fraction of near-black pixels above which a frame is treated as dark.
const DARK_FRAME_FRACTION: f32 = 0.95;
/// Luma value below which a pixel counts as near-black.
const DARK_PIXEL_LEVEL: u8 = 32;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
}

/// A decoded color frame (8-bit RGB) with its precomputed grayscale plane.
#[derive(Clone)]
pub struct Frame {
    pub rgb: RgbImage,
    pub luma: GrayImage,
}

impl Frame {
    /// Wrap an already decoded RGB image.
    pub fn from_rgb(rgb: RgbImage) -> Result<Self, FrameError> {
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(FrameError::Empty);
        }
        let luma = image::imageops::grayscale(&rgb);
        Ok(Self { rgb, luma })
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// Average luma brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let data = self.luma.as_raw();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }

    /// True when the frame is too dark to contain a usable face.
    pub fn is_dark(&self) -> bool {
        is_dark_frame(self.luma.as_raw(), DARK_FRAME_FRACTION)
    }
}

/// Decode an encoded image (PNG, JPEG, ...) into a [`Frame`].
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    Frame::from_rgb(rgb)
}

/// Check whether more than `threshold_pct` of the pixels are near-black.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < DARK_PIXEL_LEVEL).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
