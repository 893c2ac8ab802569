//! In-memory RGBA bitmap used for fixtures, mock screenshots and diff output.

use image::{ImageBuffer, RgbaImage};
use std::io::Cursor;

use crate::error::{RegressError, RegressResult};

/// A virtual framebuffer with a small drawing API
///
/// - `fill()` - Fill entire buffer with a color
/// - `draw_rect()` - Draw a filled rectangle
/// - `get_pixel()` / `set_pixel()` - Direct pixel access
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    /// RGBA pixel buffer (row-major, 4 bytes per pixel)
    buffer: Vec<u8>,
}

impl Bitmap {
    /// Create a new opaque black bitmap
    pub fn new(width: u32, height: u32) -> Self {
        let mut bitmap = Self {
            width,
            height,
            buffer: vec![0u8; (width as usize) * (height as usize) * 4],
        };
        bitmap.fill([0, 0, 0, 255]);
        bitmap
    }

    /// Create a bitmap filled with a color
    pub fn with_color(width: u32, height: u32, color: [u8; 4]) -> Self {
        let mut bitmap = Self::new(width, height);
        bitmap.fill(color);
        bitmap
    }

    /// Decode PNG (or any format the image crate recognizes)
    pub fn from_png_bytes(data: &[u8]) -> RegressResult<Self> {
        let rgba = image::load_from_memory(data)?.to_rgba8();
        Ok(Self::from_image(rgba))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            buffer: image.into_raw(),
        }
    }

    /// Wrap raw RGBA bytes
    pub fn from_raw_rgba(width: u32, height: u32, data: Vec<u8>) -> RegressResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if data.len() != expected {
            return Err(RegressError::Config(format!(
                "buffer size mismatch: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            buffer: data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn fill(&mut self, color: [u8; 4]) {
        for chunk in self.buffer.chunks_exact_mut(4) {
            chunk.copy_from_slice(&color);
        }
    }

    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 4]) {
        for py in y..(y.saturating_add(h)).min(self.height) {
            for px in x..(x.saturating_add(w)).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Out-of-bounds reads return transparent black
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 4] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0, 0];
        }
        let idx = self.index(x, y);
        [
            self.buffer[idx],
            self.buffer[idx + 1],
            self.buffer[idx + 2],
            self.buffer[idx + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.index(x, y);
        self.buffer[idx..idx + 4].copy_from_slice(&color);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn to_image(&self) -> Option<RgbaImage> {
        ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
    }

    /// Encode as PNG bytes
    pub fn to_png(&self) -> RegressResult<Vec<u8>> {
        let img = self
            .to_image()
            .ok_or_else(|| RegressError::Config("bitmap buffer does not match dimensions".to_string()))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }

    fn index(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.width as usize) + (x as usize)) * 4
    }
}
