//! RGB drawing surface used to render simulated screens and annotate screenshots.
//!
//! Provides a small drawing API:
//! - `fill()` - Fill the whole canvas with a color
//! - `draw_rect()` / `draw_outline()` - Filled and outlined rectangles
//! - `draw_text()` - Text using font8x8 glyphs
//! - `to_png()` / `to_image()` - Encoding

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, ImageError, RgbImage};
use std::io::Cursor;

/// Width and height of a font8x8 glyph in pixels
pub const GLYPH_SIZE: u32 = 8;

#[derive(Debug, Clone)]
pub struct Canvas {
    width: u32,
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
}

impl Canvas {
    /// Create a new canvas with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0u8; (width * height * 3) as usize],
        }
    }

    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut canvas = Self::new(width, height);
        canvas.fill(color);
        canvas
    }

    /// Load a canvas from encoded image bytes (PNG, JPEG)
    pub fn from_image_bytes(data: &[u8]) -> Result<Self, ImageError> {
        let rgb = image::load_from_memory(data)?.to_rgb8();
        Ok(Self {
            width: rgb.width(),
            height: rgb.height(),
            buffer: rgb.into_raw(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fill(&mut self, color: [u8; 3]) {
        for chunk in self.buffer.chunks_exact_mut(3) {
            chunk.copy_from_slice(&color);
        }
    }

    /// Draw a filled rectangle, clipped to the canvas
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y.saturating_add(h)).min(self.height) {
            for px in x..(x.saturating_add(w)).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw a rectangle border `thickness` pixels wide
    pub fn draw_outline(&mut self, x: u32, y: u32, w: u32, h: u32, thickness: u32, color: [u8; 3]) {
        let t = thickness.min(w / 2).min(h / 2).max(1);
        self.draw_rect(x, y, w, t, color);
        self.draw_rect(x, (y + h).saturating_sub(t), w, t, color);
        self.draw_rect(x, y, t, h, color);
        self.draw_rect((x + w).saturating_sub(t), y, t, h, color);
    }

    /// Draw text using font8x8 glyphs. Text does not wrap.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        self.draw_text_scaled(x, y, text, 1, fg, bg);
    }

    /// Draw text scaled up by an integer factor
    pub fn draw_text_scaled(&mut self, x: u32, y: u32, text: &str, scale: u32, fg: [u8; 3], bg: [u8; 3]) {
        let scale = scale.max(1);
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width {
                break;
            }
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row_idx, row) in glyph.iter().enumerate() {
                for bit in 0..GLYPH_SIZE {
                    // font8x8 stores LSB as leftmost pixel
                    let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                    self.draw_rect(
                        cursor_x + bit * scale,
                        y + row_idx as u32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
            cursor_x += GLYPH_SIZE * scale;
        }
    }

    fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    pub fn to_image(&self) -> RgbImage {
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Encode the canvas as PNG bytes
    pub fn to_png(&self) -> Result<Vec<u8>, ImageError> {
        let mut bytes = Vec::new();
        self.to_image()
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}
