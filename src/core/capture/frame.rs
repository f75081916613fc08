//! Frames
//!
//! Backends hand over pixels in whatever channel order and row orientation
//! they use. `RawFrame::normalize` converts once, at the callback boundary,
//! into top-down RGB.

use super::CaptureError;
use chrono::{DateTime, Local};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

/// Channel order of interleaved 3-channel pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    /// Blue, green, red
    Bgr,
    /// Red, green, blue
    Rgb,
}

/// Frame as delivered by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Interleaved pixel bytes, 3 per pixel
    pub data: Vec<u8>,
    /// Channel order of `data`
    pub order: ChannelOrder,
    /// Rows stored bottom row first
    pub bottom_up: bool,
}

impl RawFrame {
    /// Convert into a top-down RGB frame
    pub fn normalize(self, sequence: u64) -> Result<Frame, CaptureError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.width == 0 || self.height == 0 || self.data.len() != expected {
            return Err(CaptureError::InvalidFrame(format!(
                "{}x{} frame with {} bytes",
                self.width,
                self.height,
                self.data.len()
            )));
        }

        let mut data = self.data;
        if self.order == ChannelOrder::Bgr {
            for pixel in data.chunks_exact_mut(3) {
                pixel.swap(0, 2);
            }
        }

        let mut image = RgbImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| CaptureError::InvalidFrame("buffer size mismatch".into()))?;
        if self.bottom_up {
            image::imageops::flip_vertical_in_place(&mut image);
        }

        Ok(Frame {
            image: Arc::new(image),
            sequence,
            captured_at: Local::now(),
        })
    }
}

/// Normalized frame: top-down RGB
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    sequence: u64,
    captured_at: DateTime<Local>,
}

impl Frame {
    /// Pixels
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Per-run frame counter, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the frame was normalized
    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Write the frame as PNG
    pub fn save_png(&self, path: &Path) -> Result<(), CaptureError> {
        self.image
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(CaptureError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_rows(order: ChannelOrder, bottom_up: bool) -> RawFrame {
        // 1x2 image: row 0 = (1,2,3), row 1 = (4,5,6)
        RawFrame {
            width: 1,
            height: 2,
            data: vec![1, 2, 3, 4, 5, 6],
            order,
            bottom_up,
        }
    }

    #[test]
    fn test_bgr_is_swapped() {
        let frame = two_rows(ChannelOrder::Bgr, false).normalize(0).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(frame.image().get_pixel(0, 1).0, [6, 5, 4]);
    }

    #[test]
    fn test_bottom_up_is_flipped() {
        let frame = two_rows(ChannelOrder::Rgb, true).normalize(7).unwrap();
        assert_eq!(frame.image().get_pixel(0, 0).0, [4, 5, 6]);
        assert_eq!(frame.image().get_pixel(0, 1).0, [1, 2, 3]);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut raw = two_rows(ChannelOrder::Rgb, false);
        raw.data.pop();
        assert!(matches!(raw.normalize(0), Err(CaptureError::InvalidFrame(_))));
    }
}
