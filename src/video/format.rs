//! Raw video pixel formats and their memory layout.

use std::{fmt, str::FromStr};

/// Layout of a single plane of a video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Bytes per sample in this plane
    pub pstride: u32,
    /// Horizontal subsampling as a power of two
    pub xshift: u32,
    /// Vertical subsampling as a power of two
    pub yshift: u32,
}

const fn plane(pstride: u32, xshift: u32, yshift: u32) -> PlaneLayout {
    PlaneLayout {
        pstride,
        xshift,
        yshift,
    }
}

const PACKED_32: &[PlaneLayout] = &[plane(4, 0, 0)];
const PACKED_24: &[PlaneLayout] = &[plane(3, 0, 0)];
const PACKED_16: &[PlaneLayout] = &[plane(2, 0, 0)];
const PLANAR_420: &[PlaneLayout] = &[plane(1, 0, 0), plane(1, 1, 1), plane(1, 1, 1)];
const PLANAR_422: &[PlaneLayout] = &[plane(1, 0, 0), plane(1, 1, 0), plane(1, 1, 0)];
const SEMI_420: &[PlaneLayout] = &[plane(1, 0, 0), plane(2, 1, 1)];
const SEMI_422: &[PlaneLayout] = &[plane(1, 0, 0), plane(2, 1, 0)];
const SEMI_444: &[PlaneLayout] = &[plane(1, 0, 0), plane(2, 0, 0)];

macro_rules! video_formats {
    ($($variant: ident => $name: literal, $planes: expr;)*) => {
        /// Raw video formats the compositor can exchange with its peers.
        ///
        /// Names follow the usual media-framework spelling (`BGRx`, `NV12`, `I420`, ...),
        /// describing the byte order in memory.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum VideoFormat {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )*
        }

        impl VideoFormat {
            /// All known formats
            pub const ALL: &'static [VideoFormat] = &[$(VideoFormat::$variant,)*];

            /// Canonical name of the format
            pub const fn name(self) -> &'static str {
                match self {
                    $(VideoFormat::$variant => $name,)*
                }
            }

            /// Per-plane memory layout
            pub const fn planes(self) -> &'static [PlaneLayout] {
                match self {
                    $(VideoFormat::$variant => $planes,)*
                }
            }
        }

        impl FromStr for VideoFormat {
            type Err = UnknownVideoFormat;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(VideoFormat::$variant),)*
                    _ => Err(UnknownVideoFormat(s.to_owned())),
                }
            }
        }
    };
}

video_formats! {
    Bgra => "BGRA", PACKED_32;
    Bgrx => "BGRx", PACKED_32;
    Rgba => "RGBA", PACKED_32;
    Rgbx => "RGBx", PACKED_32;
    Argb => "ARGB", PACKED_32;
    Xrgb => "xRGB", PACKED_32;
    Abgr => "ABGR", PACKED_32;
    Xbgr => "xBGR", PACKED_32;
    Rgb => "RGB", PACKED_24;
    Bgr => "BGR", PACKED_24;
    Rgb16 => "RGB16", PACKED_16;
    Bgr16 => "BGR16", PACKED_16;
    Uyvy => "UYVY", PACKED_16;
    Yuy2 => "YUY2", PACKED_16;
    Yvyu => "YVYU", PACKED_16;
    I420 => "I420", PLANAR_420;
    Yv12 => "YV12", PLANAR_420;
    Y42b => "Y42B", PLANAR_422;
    Nv12 => "NV12", SEMI_420;
    Nv21 => "NV21", SEMI_420;
    Nv16 => "NV16", SEMI_422;
    Nv61 => "NV61", SEMI_422;
    Nv24 => "NV24", SEMI_444;
}

/// Error returned when parsing an unknown format name
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown video format `{0}`")]
pub struct UnknownVideoFormat(pub String);

impl VideoFormat {
    /// Number of memory planes
    pub fn n_planes(self) -> usize {
        self.planes().len()
    }

    /// Packed 4:2:2 formats store two pixels per 4-byte macropixel
    pub fn is_packed_422(self) -> bool {
        matches!(self, VideoFormat::Uyvy | VideoFormat::Yuy2 | VideoFormat::Yvyu)
    }

    /// Number of bytes a row of `plane` occupies for a frame `width` pixels wide,
    /// without padding.
    pub fn row_bytes(self, plane: usize, width: u32) -> usize {
        let layout = self.planes()[plane];
        let width = if self.is_packed_422() {
            round_up(width, 2)
        } else {
            width
        };
        (subsampled(width, layout.xshift) * layout.pstride) as usize
    }

    /// Number of rows `plane` has for a frame `height` pixels high.
    pub fn plane_rows(self, plane: usize, height: u32) -> usize {
        subsampled(height, self.planes()[plane].yshift) as usize
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `ceil(value / 2^shift)`
pub(crate) const fn subsampled(value: u32, shift: u32) -> u32 {
    (value + (1 << shift) - 1) >> shift
}

pub(crate) const fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}
