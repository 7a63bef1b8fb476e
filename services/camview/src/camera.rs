//! Camera identities and the optional crop region applied to derivatives.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a camera's crop region.
#[derive(Debug, Error, PartialEq)]
pub enum CameraError {
    #[error("Crop region must have four comma-separated coordinates, got {0:?}")]
    WrongArity(String),

    #[error("Invalid crop coordinate {0:?}")]
    InvalidCoordinate(String),

    #[error("Crop region {0} is empty after resolving against the image")]
    EmptyRegion(String),
}

/// One crop coordinate, either absolute or relative to the image dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CropCoord {
    Pixels(u32),
    Percent(f32),
}

impl CropCoord {
    /// Resolve against an image dimension, clamped to `0..=extent`.
    pub fn resolve(self, extent: u32) -> u32 {
        match self {
            CropCoord::Pixels(px) => px.min(extent),
            CropCoord::Percent(pct) => {
                let px = (extent as f32 * pct / 100.0).round();
                (px.max(0.0) as u32).min(extent)
            }
        }
    }
}

impl FromStr for CropCoord {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || CameraError::InvalidCoordinate(s.to_string());

        if let Some(pct) = s.strip_suffix('%') {
            let pct: f32 = pct.trim().parse().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(invalid());
            }
            Ok(CropCoord::Percent(pct))
        } else {
            s.parse().map(CropCoord::Pixels).map_err(|_| invalid())
        }
    }
}

impl fmt::Display for CropCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CropCoord::Pixels(px) => write!(f, "{}", px),
            CropCoord::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

/// Rectangle `(x1, y1)`–`(x2, y2)`, top-left to bottom-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRegion {
    pub x1: CropCoord,
    pub y1: CropCoord,
    pub x2: CropCoord,
    pub y2: CropCoord,
}

/// A crop region resolved to pixel offsets for a concrete image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// Resolve the region against an image of the given size.
    pub fn resolve(&self, width: u32, height: u32) -> Result<PixelRect, CameraError> {
        let x1 = self.x1.resolve(width);
        let y1 = self.y1.resolve(height);
        let x2 = self.x2.resolve(width);
        let y2 = self.y2.resolve(height);

        if x2 <= x1 || y2 <= y1 {
            return Err(CameraError::EmptyRegion(self.to_string()));
        }

        Ok(PixelRect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

impl FromStr for CropRegion {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return Err(CameraError::WrongArity(s.to_string()));
        }

        Ok(Self {
            x1: parts[0].parse()?,
            y1: parts[1].parse()?,
            x2: parts[2].parse()?,
            y2: parts[3].parse()?,
        })
    }
}

impl fmt::Display for CropRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Camera entry as it appears in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Directory name the camera uploads into (case sensitive)
    pub shortname: String,
    /// Descriptive name shown on generated pages
    pub longname: String,
    /// Optional crop for medium-resolution images and thumbnails
    #[serde(default)]
    pub crop: Option<String>,
}

/// Immutable camera identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub shortname: String,
    pub longname: String,
    pub crop: Option<CropRegion>,
}

impl Camera {
    pub fn new(shortname: impl Into<String>, longname: impl Into<String>) -> Self {
        Self {
            shortname: shortname.into(),
            longname: longname.into(),
            crop: None,
        }
    }

    pub fn with_crop(mut self, crop: CropRegion) -> Self {
        self.crop = Some(crop);
        self
    }

    /// Identity for a camera directory that has no configuration entry.
    pub fn unconfigured(shortname: &str) -> Self {
        Self::new(shortname, shortname)
    }
}

impl TryFrom<&CameraConfig> for Camera {
    type Error = CameraError;

    fn try_from(config: &CameraConfig) -> Result<Self, Self::Error> {
        let crop = config.crop.as_deref().map(str::parse).transpose()?;

        Ok(Self {
            shortname: config.shortname.clone(),
            longname: config.longname.clone(),
            crop,
        })
    }
}

/// Look up a camera by its directory name.
pub fn find<'a>(cameras: &'a [Camera], shortname: &str) -> Option<&'a Camera> {
    cameras.iter().find(|c| c.shortname == shortname)
}
