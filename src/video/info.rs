//! Negotiated frame geometry.

use super::{
    caps::{CapsStructure, Fraction, Range, VideoCaps},
    format::{round_up, VideoFormat},
};

/// Maximum number of planes any supported format has
pub const MAX_PLANES: usize = 4;

/// Error when caps cannot be turned into a [`VideoInfo`]
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidCaps {
    /// Caps still contain more than one configuration
    #[error("caps are not fixed: {0}")]
    NotFixed(String),
    /// Width or height is not positive
    #[error("invalid frame size {width}x{height}")]
    InvalidSize {
        /// Width
        width: i32,
        /// Height
        height: i32,
    },
}

/// Layout of a frame of a given format and size.
///
/// Strides are aligned to four bytes, planes follow each other without gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    /// Pixel format
    pub format: VideoFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Framerate, `0/1` if unknown
    pub fps: Fraction,
    /// Pixel aspect ratio
    pub par: Fraction,
    /// Bytes per row of each plane
    pub strides: [u32; MAX_PLANES],
    /// Byte offset of each plane
    pub offsets: [usize; MAX_PLANES],
    /// Total size of a frame in bytes
    pub size: usize,
}

impl VideoInfo {
    /// Default layout for a `width`x`height` frame of `format`
    pub fn new(format: VideoFormat, width: u32, height: u32) -> VideoInfo {
        let mut info = VideoInfo {
            format,
            width,
            height,
            fps: Fraction::new(0, 1),
            par: Fraction::new(1, 1),
            strides: [0; MAX_PLANES],
            offsets: [0; MAX_PLANES],
            size: 0,
        };
        let mut offset = 0;
        for plane in 0..format.n_planes() {
            let stride = round_up(format.row_bytes(plane, width) as u32, 4);
            info.strides[plane] = stride;
            info.offsets[plane] = offset;
            offset += stride as usize * format.plane_rows(plane, height);
        }
        info.size = offset;
        info
    }

    /// Set the framerate
    pub fn with_fps(mut self, fps: Fraction) -> VideoInfo {
        self.fps = fps;
        self
    }

    /// Set the pixel aspect ratio
    pub fn with_par(mut self, par: Fraction) -> VideoInfo {
        self.par = par;
        self
    }

    /// Number of planes
    pub fn n_planes(&self) -> usize {
        self.format.n_planes()
    }

    /// Parse fixed caps
    pub fn from_caps(caps: &VideoCaps) -> Result<VideoInfo, InvalidCaps> {
        let structure = caps
            .structure(0)
            .filter(|_| caps.is_fixed())
            .ok_or_else(|| InvalidCaps::NotFixed(caps.to_string()))?;
        let (width, height) = (structure.width.min, structure.height.min);
        if width <= 0 || height <= 0 {
            return Err(InvalidCaps::InvalidSize { width, height });
        }
        let mut info = VideoInfo::new(structure.formats[0], width as u32, height as u32)
            .with_fps(structure.framerate.min);
        if let Some(par) = structure.pixel_aspect_ratio {
            info.par = par.min;
        }
        Ok(info)
    }

    /// Fixed caps describing this layout
    pub fn to_caps(&self) -> VideoCaps {
        VideoCaps::new(
            CapsStructure::new([self.format])
                .with_size(Range::fixed(self.width as i32), Range::fixed(self.height as i32))
                .with_framerate(Range::fixed(self.fps))
                .with_pixel_aspect_ratio(Range::fixed(self.par)),
        )
    }
}
