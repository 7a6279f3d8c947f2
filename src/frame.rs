use image::{imageops::FilterType, DynamicImage, RgbImage};
use std::time::Instant;

/// Side length of the square buffer every captured frame is rendered into.
pub const FRAME_SIZE: u32 = 224;

/// A captured camera frame rendered into a fixed-size RGB buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic capture counter; repeats of the same frame share it
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    /// Render `image` into a `width`x`height` buffer, stretching like a canvas draw.
    pub fn render(image: &DynamicImage, width: u32, height: u32, sequence: u64) -> Self {
        let image = if image.width() == width && image.height() == height {
            image.to_rgb8()
        } else {
            image.resize_exact(width, height, FilterType::Triangle).to_rgb8()
        };

        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from raw RGB bytes as delivered by a capture backend.
    pub fn from_rgb(
        width: u32,
        height: u32,
        data: Vec<u8>,
        target: (u32, u32),
        sequence: u64,
    ) -> Option<Self> {
        let raw = RgbImage::from_raw(width, height, data)?;
        Some(Self::render(&DynamicImage::ImageRgb8(raw), target.0, target.1, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
