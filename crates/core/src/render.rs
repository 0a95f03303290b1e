//! Render options, pixel formats and the host-side finishing pass
//! (crop, rotation, channel layout) applied to engine rasters.

use crate::{Error, Result};
use image::{imageops, DynamicImage, GrayImage, ImageFormat, Rgba, RgbaImage};
use pdf_engine::RenderRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// Margins to remove from each side of the page, in points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Crop {
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
    pub top: f32,
}

impl Crop {
    pub fn new(left: f32, bottom: f32, right: f32, top: f32) -> Self {
        Self { left, bottom, right, top }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub scale: f32,
    /// Clockwise rotation in degrees: 0, 90, 180 or 270.
    pub rotation: u16,
    pub crop: Crop,
    pub fill_color: [u8; 4],
    pub grayscale: bool,
    pub draw_annotations: bool,
    pub draw_forms: bool,
    /// Emit RGB-ordered channels instead of the engine's native BGR order.
    pub rev_byteorder: bool,
    /// Prefer a padded 4-channel layout over 3 channels.
    pub prefer_bgrx: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotation: 0,
            crop: Crop::default(),
            fill_color: [255, 255, 255, 255],
            grayscale: false,
            draw_annotations: true,
            draw_forms: true,
            rev_byteorder: false,
            prefer_bgrx: false,
        }
    }
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_rotation(mut self, rotation: u16) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_crop(mut self, crop: Crop) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_fill_color(mut self, fill_color: [u8; 4]) -> Self {
        self.fill_color = fill_color;
        self
    }

    pub fn with_grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    pub fn with_annotations(mut self, draw_annotations: bool) -> Self {
        self.draw_annotations = draw_annotations;
        self
    }

    pub fn with_forms(mut self, draw_forms: bool) -> Self {
        self.draw_forms = draw_forms;
        self
    }

    pub fn with_rev_byteorder(mut self, rev_byteorder: bool) -> Self {
        self.rev_byteorder = rev_byteorder;
        self
    }

    pub fn with_prefer_bgrx(mut self, prefer_bgrx: bool) -> Self {
        self.prefer_bgrx = prefer_bgrx;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(Error::InvalidRenderOptions(format!(
                "scale must be positive, got {}",
                self.scale
            )));
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(Error::InvalidRenderOptions(format!(
                "rotation must be 0, 90, 180 or 270, got {}",
                self.rotation
            )));
        }
        let Crop { left, bottom, right, top } = self.crop;
        if [left, bottom, right, top].iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::InvalidRenderOptions(
                "crop margins must be non-negative".to_owned(),
            ));
        }
        Ok(())
    }

    /// The pixel layout a render with these options produces.
    pub fn pixel_format(&self) -> PixelFormat {
        if self.grayscale {
            return PixelFormat::L;
        }

        let format = if self.fill_color[3] < 255 {
            PixelFormat::Bgra
        } else if self.prefer_bgrx {
            PixelFormat::Bgrx
        } else {
            PixelFormat::Bgr
        };

        if self.rev_byteorder {
            format.reversed()
        } else {
            format
        }
    }

    pub(crate) fn request(&self) -> RenderRequest {
        RenderRequest {
            scale: self.scale,
            fill_color: self.fill_color,
            grayscale: self.grayscale,
            draw_annotations: self.draw_annotations,
            draw_forms: self.draw_forms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    L,
    Bgr,
    Rgb,
    Bgra,
    Rgba,
    Bgrx,
    Rgbx,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            Self::L => 1,
            Self::Bgr | Self::Rgb => 3,
            Self::Bgra | Self::Rgba | Self::Bgrx | Self::Rgbx => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::L => "L",
            Self::Bgr => "BGR",
            Self::Rgb => "RGB",
            Self::Bgra => "BGRA",
            Self::Rgba => "RGBA",
            Self::Bgrx => "BGRX",
            Self::Rgbx => "RGBX",
        }
    }

    fn reversed(self) -> Self {
        match self {
            Self::Bgr => Self::Rgb,
            Self::Bgra => Self::Rgba,
            Self::Bgrx => Self::Rgbx,
            other => other,
        }
    }

    fn encode(self, Rgba([r, g, b, a]): Rgba<u8>, out: &mut Vec<u8>) {
        match self {
            Self::L => out.push(luma(r, g, b)),
            Self::Bgr => out.extend_from_slice(&[b, g, r]),
            Self::Rgb => out.extend_from_slice(&[r, g, b]),
            Self::Bgra => out.extend_from_slice(&[b, g, r, a]),
            Self::Rgba => out.extend_from_slice(&[r, g, b, a]),
            Self::Bgrx => out.extend_from_slice(&[b, g, r, 255]),
            Self::Rgbx => out.extend_from_slice(&[r, g, b, 255]),
        }
    }

    fn decode(self, px: &[u8]) -> Rgba<u8> {
        match self {
            Self::L => Rgba([px[0], px[0], px[0], 255]),
            Self::Bgr => Rgba([px[2], px[1], px[0], 255]),
            Self::Rgb => Rgba([px[0], px[1], px[2], 255]),
            Self::Bgra => Rgba([px[2], px[1], px[0], px[3]]),
            Self::Rgba => Rgba([px[0], px[1], px[2], px[3]]),
            Self::Bgrx => Rgba([px[2], px[1], px[0], 255]),
            Self::Rgbx => Rgba([px[0], px[1], px[2], 255]),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// A rendered page as a tightly packed pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: usize,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl RenderedPage {
    pub fn into_image(self) -> RgbaImage {
        let channels = self.format.channels();
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let offset = y as usize * self.stride + x as usize * channels;
            self.format.decode(&self.pixels[offset..offset + channels])
        })
    }

    pub fn encode_png(self) -> Result<Vec<u8>> {
        let image = if self.format == PixelFormat::L {
            let (width, height) = (self.width, self.height);
            match GrayImage::from_raw(width, height, self.pixels) {
                Some(gray) => DynamicImage::ImageLuma8(gray),
                None => {
                    return Err(Error::InvalidRenderOptions(format!(
                        "grayscale buffer does not match {width}x{height}"
                    )))
                }
            }
        } else {
            DynamicImage::ImageRgba8(self.into_image())
        };

        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

/// Apply crop and rotation to an engine raster and pack it as `options` asks.
pub(crate) fn finish(raster: RgbaImage, options: &RenderOptions) -> Result<RenderedPage> {
    let cropped = crop(raster, options)?;
    let rotated = match options.rotation {
        90 => imageops::rotate90(&cropped),
        180 => imageops::rotate180(&cropped),
        270 => imageops::rotate270(&cropped),
        _ => cropped,
    };

    let format = options.pixel_format();
    let (width, height) = rotated.dimensions();
    let mut pixels = Vec::with_capacity(width as usize * height as usize * format.channels());
    for pixel in rotated.pixels() {
        format.encode(*pixel, &mut pixels);
    }

    Ok(RenderedPage { width, height, stride: width as usize * format.channels(), format, pixels })
}

fn crop(raster: RgbaImage, options: &RenderOptions) -> Result<RgbaImage> {
    let crop = options.crop;
    if crop == Crop::default() {
        return Ok(raster);
    }

    let px = |points: f32| (points * options.scale).round() as u32;
    let (width, height) = raster.dimensions();
    let (left, right, top, bottom) = (px(crop.left), px(crop.right), px(crop.top), px(crop.bottom));

    if left.saturating_add(right) >= width || top.saturating_add(bottom) >= height {
        return Err(Error::InvalidRenderOptions(format!(
            "crop removes the whole {width}x{height} page"
        )));
    }

    Ok(imageops::crop_imm(&raster, left, top, width - left - right, height - top - bottom)
        .to_image())
}
