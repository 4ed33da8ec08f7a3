//! CPU frame copies between buffers of the same format.

use super::{
    buffer::{MapError, VideoBuffer},
    format::VideoFormat,
    info::{VideoInfo, MAX_PLANES},
};

/// Error copying a frame
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Mapping one of the buffers failed
    #[error(transparent)]
    Map(#[from] MapError),
    /// Source and destination formats differ
    #[error("cannot copy {src} frames into {dst} frames")]
    FormatMismatch {
        /// Source format
        src: VideoFormat,
        /// Destination format
        dst: VideoFormat,
    },
    /// A row lies outside of the buffer memory
    #[error("row {row} of plane {plane} is out of bounds")]
    OutOfBounds {
        /// Plane index
        plane: usize,
        /// Row index
        row: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    width: u32,
    height: u32,
    strides: [u32; MAX_PLANES],
    offsets: [usize; MAX_PLANES],
}

fn layout(buffer: &VideoBuffer, info: &VideoInfo) -> FrameLayout {
    match buffer.video_meta() {
        Some(meta) => FrameLayout {
            width: meta.width,
            height: meta.height,
            strides: meta.strides,
            offsets: meta.offsets,
        },
        None => FrameLayout {
            width: info.width,
            height: info.height,
            strides: info.strides,
            offsets: info.offsets,
        },
    }
}

/// Copy the visible pixels of `src` into `dst`, plane by plane.
///
/// Plane layouts come from each buffer's video meta if present, else from the given info.
/// Only the area both frames share is copied.
#[profiling::function]
pub fn copy_frame(
    src: &VideoBuffer,
    src_info: &VideoInfo,
    dst: &VideoBuffer,
    dst_info: &VideoInfo,
) -> Result<(), CopyError> {
    if src_info.format != dst_info.format {
        return Err(CopyError::FormatMismatch {
            src: src_info.format,
            dst: dst_info.format,
        });
    }
    let format = src_info.format;
    let src_layout = layout(src, src_info);
    let dst_layout = layout(dst, dst_info);
    let width = src_layout.width.min(dst_layout.width);
    let height = src_layout.height.min(dst_layout.height);

    let src_map = src.map()?;
    let mut dst_map = dst.map()?;

    for plane in 0..format.n_planes() {
        let row_bytes = format.row_bytes(plane, width);
        for row in 0..format.plane_rows(plane, height) {
            let src_offset = src_layout.offsets[plane] + row * src_layout.strides[plane] as usize;
            let dst_offset = dst_layout.offsets[plane] + row * dst_layout.strides[plane] as usize;
            let from = src_map
                .range(src_offset, row_bytes)
                .ok_or(CopyError::OutOfBounds { plane, row })?;
            let to = dst_map
                .range_mut(dst_offset, row_bytes)
                .ok_or(CopyError::OutOfBounds { plane, row })?;
            to.copy_from_slice(from);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{
        buffer::{Memory, SystemMemory, VideoMeta},
        format::VideoFormat,
    };

    fn filled(info: &VideoInfo) -> VideoBuffer {
        let data = (0..info.size).map(|i| (i % 251) as u8).collect();
        VideoBuffer::from_memory(Memory::System(SystemMemory::from_vec(data)))
    }

    #[test]
    fn copies_identical_layouts() {
        let info = VideoInfo::new(VideoFormat::Nv12, 64, 48);
        let src = filled(&info);
        let dst = VideoBuffer::from_memory(Memory::System(SystemMemory::new(info.size)));
        copy_frame(&src, &info, &dst, &info).unwrap();
        assert_eq!(
            src.map().unwrap().range(0, info.size),
            dst.map().unwrap().range(0, info.size)
        );
    }

    #[test]
    fn honours_destination_strides() {
        let info = VideoInfo::new(VideoFormat::Bgrx, 4, 2);
        let src = filled(&info);
        let mut meta = VideoMeta::from_info(&info);
        meta.strides[0] = 32;
        let dst = VideoBuffer::builder()
            .memory(Memory::System(SystemMemory::new(64)))
            .video_meta(meta)
            .build();
        copy_frame(&src, &info, &dst, &info).unwrap();

        let src_map = src.map().unwrap();
        let dst_map = dst.map().unwrap();
        assert_eq!(dst_map.range(32, 16), src_map.range(16, 16));
        assert_eq!(dst_map.range(16, 16), Some(&[0u8; 16][..]));
    }

    #[test]
    fn rejects_mismatching_formats() {
        let a = VideoInfo::new(VideoFormat::Nv12, 16, 16);
        let b = VideoInfo::new(VideoFormat::I420, 16, 16);
        let src = filled(&a);
        let dst = filled(&b);
        assert!(matches!(
            copy_frame(&src, &a, &dst, &b),
            Err(CopyError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn short_destination_is_an_error() {
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 16);
        let src = filled(&info);
        let dst = VideoBuffer::from_memory(Memory::System(SystemMemory::new(64)));
        assert!(matches!(
            copy_frame(&src, &info, &dst, &info),
            Err(CopyError::OutOfBounds { .. })
        ));
    }
}
