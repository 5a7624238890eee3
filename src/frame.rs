use crate::error::Error;
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array3, ArrayView3, ArrayViewMut3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Rgb = [u8; 3];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An RGB image stored as a `(height, width, 3)` array.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array3<u8>,
}

impl Frame {
    pub fn black(size: FrameSize) -> Self {
        Self {
            pixels: Array3::zeros((size.height as usize, size.width as usize, 3)),
        }
    }

    pub fn filled(size: FrameSize, color: Rgb) -> Self {
        let mut frame = Self::black(size);
        for mut pixel in frame.pixels.lanes_mut(Axis(2)) {
            pixel[0] = color[0];
            pixel[1] = color[1];
            pixel[2] = color[2];
        }
        frame
    }

    pub fn from_rgb(size: FrameSize, data: Vec<u8>) -> Result<Self, Error> {
        let pixels = Array3::from_shape_vec((size.height as usize, size.width as usize, 3), data)
            .map_err(Error::FrameShape)?;
        Ok(Self { pixels })
    }

    /// Decode an encoded still image (JPEG, PNG, ...).
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let image = image::load_from_memory(bytes).map_err(Error::DecodeFrame)?;
        Self::from_image(image.to_rgb8())
    }

    pub fn from_image(image: RgbImage) -> Result<Self, Error> {
        let size = FrameSize::new(image.width(), image.height());
        Self::from_rgb(size, image.into_raw())
    }

    pub fn to_image(&self) -> Result<RgbImage, Error> {
        let size = self.size();
        RgbImage::from_raw(size.width, size.height, self.pixels.iter().copied().collect())
            .ok_or(Error::ConvertFrameToImage(size))
    }

    pub fn size(&self) -> FrameSize {
        let (height, width, _) = self.pixels.dim();
        FrameSize::new(width as u32, height as u32)
    }

    pub fn pixels(&self) -> ArrayView3<'_, u8> {
        self.pixels.view()
    }

    pub fn pixels_mut(&mut self) -> ArrayViewMut3<'_, u8> {
        self.pixels.view_mut()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        let (x, y) = (x as usize, y as usize);
        let (height, width, _) = self.pixels.dim();
        if x >= width || y >= height {
            return None;
        }
        Some([
            self.pixels[(y, x, 0)],
            self.pixels[(y, x, 1)],
            self.pixels[(y, x, 2)],
        ])
    }

    /// Blend `color` over the pixel at `(x, y)`; out-of-bounds writes are
    /// dropped.
    pub fn blend_pixel(&mut self, x: i64, y: i64, color: Rgb, alpha: f32) {
        let (height, width, _) = self.pixels.dim();
        if x < 0 || y < 0 || x as usize >= width || y as usize >= height {
            return;
        }
        let (x, y) = (x as usize, y as usize);
        let alpha = alpha.clamp(0.0, 1.0);
        for (c, &value) in color.iter().enumerate() {
            let old = f32::from(self.pixels[(y, x, c)]);
            self.pixels[(y, x, c)] = (old + (f32::from(value) - old) * alpha).round() as u8;
        }
    }

    pub fn resized(&self, size: FrameSize) -> Result<Self, Error> {
        if self.size() == size {
            return Ok(self.clone());
        }
        let image = self.to_image()?;
        Self::from_image(image::imageops::resize(
            &image,
            size.width,
            size.height,
            FilterType::Triangle,
        ))
    }

    /// Place `right` next to `left`. Both must have the same height.
    pub fn hstack(left: &Self, right: &Self) -> Result<Self, Error> {
        let pixels = ndarray::concatenate(Axis(1), &[left.pixels.view(), right.pixels.view()])
            .map_err(Error::FrameShape)?;
        Ok(Self { pixels })
    }
}
