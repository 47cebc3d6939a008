//! Decoded RGB frames and the pixel operations the pipeline applies to them.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::error::{MediaError, MediaResult};

/// Bytes per packed RGB24 pixel.
pub const BYTES_PER_PIXEL: usize = 3;

/// A single decoded 8-bit RGB image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Create a black frame.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    /// Wrap an existing image.
    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> MediaResult<Self> {
        let expected = frame_len(width, height);
        let actual = data.len();
        RgbImage::from_raw(width, height, data)
            .map(Self::from_image)
            .ok_or_else(|| {
                MediaError::internal(format!(
                    "raw frame has {} bytes, {}x{} needs {}",
                    actual, width, height, expected
                ))
            })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Packed RGB24 bytes, row-major.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    /// Resample to exactly `width` x `height` with a bilinear filter.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        if (width, height) == self.dimensions() {
            return self.clone();
        }
        Frame::from_image(imageops::resize(
            &self.image,
            width,
            height,
            FilterType::Triangle,
        ))
    }

    /// Rotate the content about the frame centre, keeping the frame size.
    ///
    /// Angles are in image coordinates (y axis pointing down), so a positive
    /// angle turns the content clockwise as displayed. Samples falling outside
    /// the source replicate the nearest edge pixel.
    pub fn rotated_about_center(&self, degrees: f64) -> Frame {
        if degrees == 0.0 || self.width() == 0 || self.height() == 0 {
            return self.clone();
        }

        let (width, height) = self.dimensions();
        let (sin, cos) = degrees.to_radians().sin_cos();
        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;

        let mut out = RgbImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            // Inverse mapping: destination point rotated back by -degrees.
            let sx = cos * dx + sin * dy + cx;
            let sy = -sin * dx + cos * dy + cy;
            *pixel = self.sample_replicate(sx, sy);
        }

        Frame::from_image(out)
    }

    /// Bilinear sample with coordinates clamped to the frame (edge replication).
    fn sample_replicate(&self, x: f64, y: f64) -> Rgb<u8> {
        let max_x = (self.width() - 1) as f64;
        let max_y = (self.height() - 1) as f64;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let x0 = x0 as u32;
        let y0 = y0 as u32;
        let x1 = (x0 + 1).min(self.width() - 1);
        let y1 = (y0 + 1).min(self.height() - 1);

        let p00 = self.image.get_pixel(x0, y0).0;
        let p10 = self.image.get_pixel(x1, y0).0;
        let p01 = self.image.get_pixel(x0, y1).0;
        let p11 = self.image.get_pixel(x1, y1).0;

        let mut result = [0u8; 3];
        for c in 0..3 {
            let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
            let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
            result[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(result)
    }
}

/// Size in bytes of one packed RGB24 frame.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}
