//! Derivative images: medium-resolution view and thumbnail.

use crate::camera::{CameraError, CropRegion};
use crate::config::DerivativeConfig;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Cannot decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Cannot encode {path}: {reason}")]
    Encode { path: String, reason: String },

    #[error(transparent)]
    Crop(#[from] CameraError),
}

/// Produces the derived images for one raw capture.
///
/// The crop region applies to the derivatives only; the full-resolution
/// image is always published unmodified.
pub trait DerivativeCodec: Send + Sync {
    fn render(
        &self,
        source: &Path,
        crop: Option<&CropRegion>,
        medium: &Path,
        thumbnail: &Path,
    ) -> Result<(), CodecError>;
}

/// JPEG codec backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageCodec {
    medium_width: u32,
    thumbnail_width: u32,
    quality: u8,
}

impl ImageCodec {
    pub fn new(config: &DerivativeConfig) -> Self {
        Self {
            medium_width: config.medium_width,
            thumbnail_width: config.thumbnail_width,
            quality: config.jpeg_quality,
        }
    }

    fn save(&self, img: &DynamicImage, width: u32, dest: &Path) -> Result<(), CodecError> {
        let encode_err = |reason: String| CodecError::Encode {
            path: dest.display().to_string(),
            reason,
        };

        // never upscale
        let scaled = if img.width() > width {
            let height = ((img.height() as u64 * width as u64) / img.width().max(1) as u64).max(1) as u32;
            img.resize_exact(width, height, FilterType::Lanczos3)
        } else {
            img.clone()
        };

        let file = File::create(dest).map_err(|e| encode_err(e.to_string()))?;
        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), self.quality);
        encoder
            .encode_image(&scaled.to_rgb8())
            .map_err(|e| encode_err(e.to_string()))
    }
}

impl DerivativeCodec for ImageCodec {
    fn render(
        &self,
        source: &Path,
        crop: Option<&CropRegion>,
        medium: &Path,
        thumbnail: &Path,
    ) -> Result<(), CodecError> {
        let img = image::open(source).map_err(|e| CodecError::Decode {
            path: source.display().to_string(),
            reason: e.to_string(),
        })?;

        let img = match crop {
            Some(region) => {
                let rect = region.resolve(img.width(), img.height())?;
                img.crop_imm(rect.x, rect.y, rect.width, rect.height)
            }
            None => img,
        };

        self.save(&img, self.medium_width, medium)?;
        self.save(&img, self.thumbnail_width, thumbnail)?;
        Ok(())
    }
}
