//! Raw video primitives: formats, negotiated layouts, caps, buffers and allocation queries.
//!
//! These types model what the compositor exchanges with the elements around it.
//! They are intentionally small: only the subset needed to negotiate and move
//! hardware-composable frames is covered.

pub mod allocation;
pub mod buffer;
pub mod caps;
pub mod format;
pub mod frame;
pub mod info;

pub use self::allocation::{AllocationMeta, AllocationPool, AllocationQuery};
pub use self::buffer::{
    CropMeta, DmaBufMemory, Memory, MemoryMap, SystemMemory, VideoBuffer, VideoBufferBuilder, VideoMeta,
};
pub use self::caps::{CapsStructure, Fraction, Range, VideoCaps};
pub use self::format::VideoFormat;
pub use self::frame::{copy_frame, CopyError};
pub use self::info::VideoInfo;
