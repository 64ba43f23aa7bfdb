//! Screenshot attachments for judgments: candidate widgets boxed in red and
//! labelled with their candidate number.

use image::ImageError;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use tracing::warn;

use super::judge::ImageAttachment;
use crate::device::{Bounds, Canvas, GLYPH_SIZE, UiState};

/// Attachments are downscaled to at most this height
pub const MAX_ATTACHMENT_HEIGHT: u32 = 512;
const JPEG_QUALITY: u8 = 80;
const MARK_COLOR: [u8; 3] = [230, 20, 20];
const LABEL_FG: [u8; 3] = [255, 255, 255];

/// Screenshot of `state` with each `(label, bounds)` boxed.
///
/// Failures are logged and yield `None`; the judgment then goes out text-only.
pub fn annotated_screenshot(state: &UiState, marks: &[(usize, Bounds)]) -> Option<ImageAttachment> {
    match render(&state.screenshot.png, marks) {
        Ok(data) => Some(ImageAttachment {
            mime: "image/jpeg".to_string(),
            data,
        }),
        Err(e) => {
            warn!(error = %e, "could not annotate screenshot, sending prompt without image");
            None
        }
    }
}

fn render(png: &[u8], marks: &[(usize, Bounds)]) -> Result<Vec<u8>, ImageError> {
    let mut canvas = Canvas::from_image_bytes(png)?;
    // Keep boxes and labels legible after the downscale
    let scale = (canvas.height() / MAX_ATTACHMENT_HEIGHT).max(1);

    for (label, bounds) in marks {
        let Some((x, y, w, h)) = clamp(bounds, canvas.width(), canvas.height()) else {
            continue;
        };
        canvas.draw_outline(x, y, w, h, 2 * scale, MARK_COLOR);
        let text = label.to_string();
        let label_h = GLYPH_SIZE * scale;
        let label_y = if y >= label_h { y - label_h } else { y };
        canvas.draw_text_scaled(x, label_y, &text, scale, LABEL_FG, MARK_COLOR);
    }

    let mut image = canvas.to_image();
    if image.height() > MAX_ATTACHMENT_HEIGHT {
        let width = (image.width() * MAX_ATTACHMENT_HEIGHT / image.height()).max(1);
        image = imageops::resize(&image, width, MAX_ATTACHMENT_HEIGHT, FilterType::Triangle);
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&image)?;
    Ok(out)
}

fn clamp(bounds: &Bounds, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let left = bounds.left.clamp(0, width as i32) as u32;
    let top = bounds.top.clamp(0, height as i32) as u32;
    let right = bounds.right.clamp(0, width as i32) as u32;
    let bottom = bounds.bottom.clamp(0, height as i32) as u32;
    (right > left && bottom > top).then(|| (left, top, right - left, bottom - top))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Screenshot;

    fn state(width: u32, height: u32) -> UiState {
        let png = Canvas::with_color(width, height, [240, 240, 240]).to_png().unwrap();
        UiState {
            elements: Vec::new(),
            screenshot: Screenshot::from_png(png).unwrap(),
            package: "com.example".into(),
            activity: None,
            crash: None,
        }
    }

    #[test]
    fn test_annotation_is_downscaled_jpeg() {
        let attachment = annotated_screenshot(&state(540, 1024), &[(0, Bounds::new(10, 100, 200, 160))]).unwrap();
        assert_eq!(attachment.mime, "image/jpeg");
        let decoded = image::load_from_memory(&attachment.data).unwrap();
        assert_eq!(decoded.height(), MAX_ATTACHMENT_HEIGHT);
        assert_eq!(decoded.width(), 270);
    }

    #[test]
    fn test_marks_are_drawn_in_red() {
        let attachment = annotated_screenshot(&state(180, 320), &[(3, Bounds::new(20, 40, 160, 80))]).unwrap();
        let rgb = image::load_from_memory(&attachment.data).unwrap().to_rgb8();
        // Left edge of the outline, below the label
        let pixel = rgb.get_pixel(20, 70);
        assert!(pixel[0] > 150 && pixel[1] < 100, "expected red, got {:?}", pixel);
    }

    #[test]
    fn test_offscreen_marks_are_skipped() {
        assert_eq!(clamp(&Bounds::new(-50, -50, -10, -10), 100, 100), None);
        assert_eq!(clamp(&Bounds::new(90, 90, 200, 200), 100, 100), Some((90, 90, 10, 10)));
    }

    #[test]
    fn test_undecodable_screenshot_yields_none() {
        let mut s = state(10, 10);
        s.screenshot.png = std::sync::Arc::new(vec![1, 2, 3]);
        assert!(annotated_screenshot(&s, &[]).is_none());
    }
}
