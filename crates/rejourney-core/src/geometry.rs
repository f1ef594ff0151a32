// rejourney — session replay for mobile apps
// https://rejourney.co

//! Window-space rectangles and the per-frame sensitive-region map.

use serde::{Deserialize, Serialize};

/// Rects narrower or shorter than this are dropped during sanitization —
/// they cannot hold legible content and inflate the redaction pass.
pub const MIN_MASKABLE_EXTENT: f32 = 10.0;

/// Axis-aligned rectangle in window coordinate space (points).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn max_x(&self) -> f32 {
        self.x + self.width
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    /// Replace any non-finite coordinate or extent with 0.
    pub fn finite_or_zero(mut self) -> Self {
        for v in [
            &mut self.x,
            &mut self.y,
            &mut self.width,
            &mut self.height,
        ] {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        self
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.max_x()
            && other.x < self.max_x()
            && self.y < other.max_y()
            && other.y < self.max_y()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());
        if max_x <= x || max_y <= y {
            return None;
        }
        Some(Rect::new(x, y, max_x - x, max_y - y))
    }

    /// Grow the rect by `pad` on every side.
    pub fn inflate(&self, pad: f32) -> Rect {
        Rect::new(
            self.x - pad,
            self.y - pad,
            self.width + 2.0 * pad,
            self.height + 2.0 * pad,
        )
    }

    /// Scale from point space into pixel space.
    pub fn scaled(&self, factor: f32) -> Rect {
        Rect::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Sanitize a candidate region: zero non-finite components, then drop
    /// rects too small to hold content or entirely outside the window.
    pub fn sanitized(self, window: &Rect) -> Option<Rect> {
        let rect = self.finite_or_zero();
        if rect.width <= MIN_MASKABLE_EXTENT || rect.height <= MIN_MASKABLE_EXTENT {
            return None;
        }
        if !rect.intersects(window) {
            return None;
        }
        Some(rect)
    }
}

/// Classification of a sensitive surface found in the view hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensitiveKind {
    TextInput,
    Camera,
    WebView,
    Video,
    ManualId,
}

impl SensitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitiveKind::TextInput => "text_input",
            SensitiveKind::Camera => "camera",
            SensitiveKind::WebView => "web_view",
            SensitiveKind::Video => "video",
            SensitiveKind::ManualId => "manual",
        }
    }

    /// Short label drawn over the occluded patch when it fits.
    pub fn label(&self) -> &'static str {
        match self {
            SensitiveKind::TextInput => "Text",
            SensitiveKind::Camera => "Camera",
            SensitiveKind::WebView => "Web",
            SensitiveKind::Video => "Video",
            SensitiveKind::ManualId => "Masked",
        }
    }

    /// Opaque fill used by the redactor, one hue per kind so masked
    /// surfaces stay distinguishable in replay.
    pub fn fill_rgba(&self) -> [u8; 4] {
        match self {
            SensitiveKind::TextInput => [38, 38, 48, 255],
            SensitiveKind::Camera => [48, 38, 38, 255],
            SensitiveKind::WebView => [38, 48, 38, 255],
            SensitiveKind::Video => [48, 44, 32, 255],
            SensitiveKind::ManualId => [40, 40, 40, 255],
        }
    }
}

/// Ordered set of sensitive regions attached to a frame. Immutable once
/// produced for a given frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensitiveRegionSet {
    pub regions: Vec<(SensitiveKind, Rect)>,
    /// Set when the scanner bailed out early or the app is backgrounded —
    /// the whole frame must be occluded.
    pub mask_all: bool,
}

impl SensitiveRegionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn masked_all() -> Self {
        Self {
            regions: Vec::new(),
            mask_all: true,
        }
    }

    pub fn push(&mut self, kind: SensitiveKind, rect: Rect) {
        self.regions.push((kind, rect));
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty() && !self.mask_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Rect {
        Rect::new(0.0, 0.0, 390.0, 844.0)
    }

    #[test]
    fn test_non_finite_zeroed() {
        let r = Rect::new(f32::NAN, f32::INFINITY, 100.0, f32::NEG_INFINITY).finite_or_zero();
        assert_eq!(r.x, 0.0);
        assert_eq!(r.y, 0.0);
        assert_eq!(r.width, 100.0);
        assert_eq!(r.height, 0.0);
    }

    #[test]
    fn test_sanitized_drops_tiny_rects() {
        assert!(Rect::new(10.0, 10.0, 10.0, 50.0).sanitized(&window()).is_none());
        assert!(Rect::new(10.0, 10.0, 50.0, 9.0).sanitized(&window()).is_none());
        assert!(Rect::new(10.0, 10.0, 50.0, 50.0).sanitized(&window()).is_some());
    }

    #[test]
    fn test_sanitized_drops_offscreen() {
        assert!(Rect::new(500.0, 0.0, 50.0, 50.0).sanitized(&window()).is_none());
        // partially on-screen survives
        assert!(Rect::new(380.0, 0.0, 50.0, 50.0).sanitized(&window()).is_some());
    }

    #[test]
    fn test_sanitized_nan_rect_dropped() {
        // NaN extent becomes 0, which is below the minimum
        assert!(Rect::new(10.0, 10.0, f32::NAN, 50.0)
            .sanitized(&window())
            .is_none());
    }

    #[test]
    fn test_intersection() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(50.0, 50.0, 100.0, 100.0);
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, Rect::new(50.0, 50.0, 50.0, 50.0));
        assert!(a.intersection(&Rect::new(200.0, 200.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_inflate_and_scale() {
        let r = Rect::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(r.inflate(4.0), Rect::new(6.0, 16.0, 38.0, 48.0));
        assert_eq!(r.scaled(2.0), Rect::new(20.0, 40.0, 60.0, 80.0));
    }

    #[test]
    fn test_region_set() {
        let mut set = SensitiveRegionSet::empty();
        assert!(set.is_empty());
        set.push(SensitiveKind::TextInput, Rect::new(0.0, 0.0, 50.0, 50.0));
        assert_eq!(set.len(), 1);
        assert!(!SensitiveRegionSet::masked_all().is_empty());
    }
}
