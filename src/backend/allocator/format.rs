//! Format tables between DRM fourcc codes and [`VideoFormat`]s.
//!
//! [`get_video_format`] maps a fourcc to the video format with the same memory layout,
//! [`get_fourcc`] does the inverse.
//!
//! ```
//! # use kms_compositor::backend::allocator::Fourcc;
//! # use kms_compositor::backend::allocator::format::{get_fourcc, get_video_format};
//! # use kms_compositor::video::VideoFormat;
//! assert_eq!(get_video_format(Fourcc::Xrgb8888), Some(VideoFormat::Bgrx));
//! assert_eq!(get_fourcc(VideoFormat::Nv12), Fourcc::Nv12);
//! ```
//!
//! [`get_dumb_bpp`] and [`get_dumb_height`] describe how a frame of a format is laid
//! out inside a single-plane dumb buffer.
//!
//! ```
//! # use kms_compositor::backend::allocator::format::{get_dumb_bpp, get_dumb_height};
//! # use kms_compositor::video::VideoFormat;
//! assert_eq!(get_dumb_bpp(VideoFormat::Nv12), 8);
//! assert_eq!(get_dumb_height(VideoFormat::Nv12, 720), 1080);
//! ```

use crate::video::VideoFormat;

/// Macro to generate table lookup functions for formats.
///
/// See the module documentation for usage details.
macro_rules! format_tables {
    (
        $($fourcc: ident {
            video: $video: ident,
            bpp: $bpp: expr,
            height: ($num: expr, $den: expr) $(,)?
        }),*
    ) => {
        /// Returns the video format with the memory layout of `fourcc`.
        ///
        /// Unknown formats will always return [`None`].
        pub const fn get_video_format(
            fourcc: $crate::backend::allocator::Fourcc,
        ) -> Option<$crate::video::VideoFormat> {
            match fourcc {
                $($crate::backend::allocator::Fourcc::$fourcc => Some($crate::video::VideoFormat::$video),)*
                _ => None,
            }
        }

        /// Returns the fourcc with the memory layout of `format`.
        pub const fn get_fourcc(format: $crate::video::VideoFormat) -> $crate::backend::allocator::Fourcc {
            match format {
                $($crate::video::VideoFormat::$video => $crate::backend::allocator::Fourcc::$fourcc,)*
            }
        }

        /// Returns the bits per pixel a dumb buffer holding `format` is allocated with.
        pub const fn get_dumb_bpp(format: $crate::video::VideoFormat) -> u32 {
            match format {
                $($crate::video::VideoFormat::$video => $bpp,)*
            }
        }

        /// Returns the number of rows a dumb buffer needs to hold all planes of a
        /// `format` frame of the given height.
        pub const fn get_dumb_height(format: $crate::video::VideoFormat, height: u32) -> u32 {
            match format {
                $($crate::video::VideoFormat::$video => height * $num / $den,)*
            }
        }

        fn _impl_formats() -> &'static [$crate::backend::allocator::Fourcc] {
            &[
                $(
                    $crate::backend::allocator::Fourcc::$fourcc,
                )*
            ]
        }
    };
}

format_tables! {
    // 32-bit RGB, byte order is reversed compared to the video names
    Argb8888 { video: Bgra, bpp: 32, height: (1, 1) },
    Xrgb8888 { video: Bgrx, bpp: 32, height: (1, 1) },
    Abgr8888 { video: Rgba, bpp: 32, height: (1, 1) },
    Xbgr8888 { video: Rgbx, bpp: 32, height: (1, 1) },
    Bgra8888 { video: Argb, bpp: 32, height: (1, 1) },
    Bgrx8888 { video: Xrgb, bpp: 32, height: (1, 1) },
    Rgba8888 { video: Abgr, bpp: 32, height: (1, 1) },
    Rgbx8888 { video: Xbgr, bpp: 32, height: (1, 1) },

    // 24 and 16-bit RGB
    Bgr888 { video: Rgb, bpp: 24, height: (1, 1) },
    Rgb888 { video: Bgr, bpp: 24, height: (1, 1) },
    Rgb565 { video: Rgb16, bpp: 16, height: (1, 1) },
    Bgr565 { video: Bgr16, bpp: 16, height: (1, 1) },

    // packed 4:2:2
    Uyvy { video: Uyvy, bpp: 16, height: (1, 1) },
    Yuyv { video: Yuy2, bpp: 16, height: (1, 1) },
    Yvyu { video: Yvyu, bpp: 16, height: (1, 1) },

    // planar
    Yuv420 { video: I420, bpp: 8, height: (3, 2) },
    Yvu420 { video: Yv12, bpp: 8, height: (3, 2) },
    Yuv422 { video: Y42b, bpp: 8, height: (2, 1) },

    // semi-planar
    Nv12 { video: Nv12, bpp: 8, height: (3, 2) },
    Nv21 { video: Nv21, bpp: 8, height: (3, 2) },
    Nv16 { video: Nv16, bpp: 8, height: (2, 1) },
    Nv61 { video: Nv61, bpp: 8, height: (2, 1) },
    Nv24 { video: Nv24, bpp: 8, height: (3, 1) }
}

/// Returns the video format of a raw fourcc code as found in driver format lists.
///
/// Codes unknown to [`drm_fourcc`] or without a video equivalent return [`None`].
pub fn video_format_from_raw(code: u32) -> Option<VideoFormat> {
    super::Fourcc::try_from(code).ok().and_then(get_video_format)
}
