// rejourney — session replay for mobile apps
// https://rejourney.co

use image::RgbaImage;
use rejourney_core::SensitiveRegionSet;
use std::time::Instant;

/// A captured raw frame. Created on the UI thread, handed off by move to
/// the encoder queue, released after encoding or drop.
#[derive(Debug)]
pub struct Frame {
    pub image: RgbaImage,
    /// Monotonic capture instant, used for ordering.
    pub monotonic: Instant,
    /// Wall-clock capture time, epoch ms — what gets persisted.
    pub wall_ms: u64,
    /// Device scale (buffer pixels per logical point).
    pub scale: f32,
    pub regions: SensitiveRegionSet,
}

impl Frame {
    pub fn new(image: RgbaImage, wall_ms: u64, scale: f32, regions: SensitiveRegionSet) -> Self {
        Self {
            image,
            monotonic: Instant::now(),
            wall_ms,
            scale,
            regions,
        }
    }

    /// Logical dimensions in points.
    pub fn logical_size(&self) -> (f32, f32) {
        let s = if self.scale.is_finite() && self.scale > 0.0 {
            self.scale
        } else {
            1.0
        };
        (
            self.image.width() as f32 / s,
            self.image.height() as f32 / s,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_size() {
        let frame = Frame::new(
            RgbaImage::new(780, 1688),
            0,
            2.0,
            SensitiveRegionSet::empty(),
        );
        assert_eq!(frame.logical_size(), (390.0, 844.0));
    }

    #[test]
    fn test_bad_scale_defaults_to_one() {
        let frame = Frame::new(
            RgbaImage::new(100, 100),
            0,
            f32::NAN,
            SensitiveRegionSet::empty(),
        );
        assert_eq!(frame.logical_size(), (100.0, 100.0));
    }
}
