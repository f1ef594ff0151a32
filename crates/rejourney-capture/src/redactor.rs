// rejourney — session replay for mobile apps
// https://rejourney.co

//! In-place occlusion of captured pixel buffers.
//!
//! The redactor runs after capture and before the frame reaches the
//! encoder queue, so nothing sensitive ever leaves the UI thread. On
//! return, no pixel inside any input rectangle reflects the pre-call
//! contents. Repeated application is a no-op.

use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_text_mut, text_size};
use rejourney_core::{Rect, SensitiveRegionSet};
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_PADDING: f32 = 4.0;
const DEFAULT_CORNER_RADIUS: f32 = 8.0;
const LABEL_POINT_SIZE: f32 = 13.0;
const LABEL_COLOR: Rgba<u8> = Rgba([205, 205, 205, 255]);
const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Occludes sensitive regions in captured frames.
pub struct Redactor {
    padding: f32,
    corner_radius: f32,
    /// Latched across background/foreground transitions: any frame that
    /// slips through while backgrounded is fully masked even when the
    /// scanner was skipped.
    app_in_background: AtomicBool,
    label_font: Option<FontArc>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    pub fn new() -> Self {
        Self {
            padding: DEFAULT_PADDING,
            corner_radius: DEFAULT_CORNER_RADIUS,
            app_in_background: AtomicBool::new(false),
            label_font: None,
        }
    }

    /// Enable kind labels over occluded patches. Without a font the patch
    /// is a plain fill; the occlusion guarantee is identical either way.
    pub fn with_label_font(mut self, font: FontArc) -> Self {
        self.label_font = Some(font);
        self
    }

    pub fn set_app_in_background(&self, backgrounded: bool) {
        self.app_in_background.store(backgrounded, Ordering::Relaxed);
    }

    pub fn app_in_background(&self) -> bool {
        self.app_in_background.load(Ordering::Relaxed)
    }

    /// Occlude `buffer` in place. `scale` converts region rects from point
    /// space into buffer-pixel space; non-finite values default to 1.
    pub fn apply(&self, buffer: &mut RgbaImage, regions: &SensitiveRegionSet, scale: f32) {
        if regions.mask_all || self.app_in_background() {
            let (w, h) = (buffer.width(), buffer.height());
            if w > 0 && h > 0 {
                draw_filled_rect_mut(
                    buffer,
                    imageproc::rect::Rect::at(0, 0).of_size(w, h),
                    BLACK,
                );
            }
            return;
        }

        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        let bounds = Rect::new(0.0, 0.0, buffer.width() as f32, buffer.height() as f32);

        for (kind, rect) in &regions.regions {
            let inflated = rect.inflate(self.padding).scaled(scale);
            let Some(clipped) = inflated.intersection(&bounds) else {
                continue;
            };

            // Only corners the clip left intact get rounded; a corner cut
            // by the buffer edge is filled square so no original pixel
            // survives at the boundary.
            let left = clipped.x <= inflated.x;
            let top = clipped.y <= inflated.y;
            let right = clipped.max_x() >= inflated.max_x();
            let bottom = clipped.max_y() >= inflated.max_y();

            self.fill_patch(
                buffer,
                &clipped,
                self.corner_radius * scale,
                Rgba(kind.fill_rgba()),
                [left && top, right && top, left && bottom, right && bottom],
            );

            if let Some(font) = &self.label_font {
                self.draw_label(buffer, &clipped, scale, font, kind.label());
            }
        }
    }

    /// Fill a rounded rectangle: three overlapping bands plus either a
    /// quarter-circle or a square per corner.
    fn fill_patch(
        &self,
        buffer: &mut RgbaImage,
        rect: &Rect,
        radius: f32,
        color: Rgba<u8>,
        rounded: [bool; 4],
    ) {
        let x0 = rect.x.floor() as i32;
        let y0 = rect.y.floor() as i32;
        let w = rect.width.ceil() as i32;
        let h = rect.height.ceil() as i32;
        if w <= 0 || h <= 0 {
            return;
        }

        let r = (radius.round() as i32).clamp(0, w.min(h) / 2);
        if r == 0 {
            draw_filled_rect_mut(
                buffer,
                imageproc::rect::Rect::at(x0, y0).of_size(w as u32, h as u32),
                color,
            );
            return;
        }

        // Center band, full height.
        if w > 2 * r {
            draw_filled_rect_mut(
                buffer,
                imageproc::rect::Rect::at(x0 + r, y0).of_size((w - 2 * r) as u32, h as u32),
                color,
            );
        }
        // Side bands, inset vertically by the radius.
        if h > 2 * r {
            for x in [x0, x0 + w - r] {
                draw_filled_rect_mut(
                    buffer,
                    imageproc::rect::Rect::at(x, y0 + r).of_size(r as u32, (h - 2 * r) as u32),
                    color,
                );
            }
        }

        let corners = [
            (x0 + r, y0 + r, x0, y0),                 // top-left
            (x0 + w - r - 1, y0 + r, x0 + w - r, y0), // top-right
            (x0 + r, y0 + h - r - 1, x0, y0 + h - r), // bottom-left
            (x0 + w - r - 1, y0 + h - r - 1, x0 + w - r, y0 + h - r), // bottom-right
        ];
        for (i, (cx, cy, sx, sy)) in corners.into_iter().enumerate() {
            if rounded[i] {
                draw_filled_circle_mut(buffer, (cx, cy), r, color);
            } else {
                draw_filled_rect_mut(
                    buffer,
                    imageproc::rect::Rect::at(sx, sy).of_size(r as u32, r as u32),
                    color,
                );
            }
        }
    }

    fn draw_label(
        &self,
        buffer: &mut RgbaImage,
        rect: &Rect,
        scale: f32,
        font: &FontArc,
        label: &str,
    ) {
        let px = PxScale::from(LABEL_POINT_SIZE * scale);
        let (tw, th) = text_size(px, font, label);
        // Only draw when the label comfortably fits inside the patch.
        if tw + 8 > rect.width as u32 || th + 4 > rect.height as u32 {
            return;
        }
        let x = rect.x as i32 + (rect.width as i32 - tw as i32) / 2;
        let y = rect.y as i32 + (rect.height as i32 - th as i32) / 2;
        draw_text_mut(buffer, LABEL_COLOR, x, y, px, font, label);
    }
}
