//! Video buffers, their memories and metadata.

use std::{
    fmt, io,
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use smallvec::SmallVec;

use super::{format::VideoFormat, info::VideoInfo, info::MAX_PLANES};
use crate::{
    backend::{
        allocator::{dmabuf::Dmabuf, Slot},
        drm::memory::KmsMemory,
    },
    utils::Mapping,
};

/// CPU memory, shared between all clones of a buffer
#[derive(Clone)]
pub struct SystemMemory(Arc<Mutex<Vec<u8>>>);

impl fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemory")
            .field("size", &self.lock().len())
            .finish()
    }
}

impl SystemMemory {
    /// Zero-initialised memory of `size` bytes
    pub fn new(size: usize) -> SystemMemory {
        SystemMemory::from_vec(vec![0; size])
    }

    /// Wrap existing bytes
    pub fn from_vec(data: Vec<u8>) -> SystemMemory {
        SystemMemory(Arc::new(Mutex::new(data)))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A region of a dma-buf
#[derive(Debug, Clone)]
pub struct DmaBufMemory {
    dmabuf: Dmabuf,
    offset: usize,
    size: usize,
}

impl DmaBufMemory {
    /// The region `offset..offset + size` of `dmabuf`
    pub fn new(dmabuf: Dmabuf, offset: usize, size: usize) -> DmaBufMemory {
        DmaBufMemory { dmabuf, offset, size }
    }

    /// The whole of `dmabuf`
    pub fn whole(dmabuf: Dmabuf) -> DmaBufMemory {
        let size = dmabuf.size();
        DmaBufMemory::new(dmabuf, 0, size)
    }

    /// Underlying dma-buf
    pub fn dmabuf(&self) -> &Dmabuf {
        &self.dmabuf
    }
}

/// A single block of memory backing (part of) a [`VideoBuffer`]
#[derive(Debug, Clone)]
pub enum Memory {
    /// Plain CPU memory
    System(SystemMemory),
    /// dma-buf memory shared with another device or process
    DmaBuf(DmaBufMemory),
    /// Memory registered as a framebuffer on our KMS device
    Kms(KmsMemory),
}

/// Error mapping memory into the address space
#[derive(Debug, thiserror::Error)]
#[error("failed to map memory")]
pub struct MapError(#[from] pub io::Error);

impl Memory {
    /// Size in bytes
    pub fn size(&self) -> usize {
        match self {
            Memory::System(mem) => mem.lock().len(),
            Memory::DmaBuf(mem) => mem.size,
            Memory::Kms(mem) => mem.size(),
        }
    }

    /// Offset of this memory into its backing object
    pub fn offset(&self) -> usize {
        match self {
            Memory::DmaBuf(mem) => mem.offset,
            _ => 0,
        }
    }

    /// The dma-buf backing this memory, if any.
    ///
    /// For KMS memory this is the PRIME-exported handle of the buffer.
    pub fn dmabuf(&self) -> Option<&Dmabuf> {
        match self {
            Memory::System(_) => None,
            Memory::DmaBuf(mem) => Some(&mem.dmabuf),
            Memory::Kms(mem) => mem.dmabuf(),
        }
    }

    /// Whether this is plain dma-buf memory
    pub fn is_dmabuf(&self) -> bool {
        matches!(self, Memory::DmaBuf(_))
    }

    /// KMS memory, if this is one
    pub fn as_kms(&self) -> Option<&KmsMemory> {
        match self {
            Memory::Kms(mem) => Some(mem),
            _ => None,
        }
    }

    /// Map the memory for CPU access
    pub fn map(&self) -> Result<MemoryMap<'_>, MapError> {
        Ok(match self {
            Memory::System(mem) => MemoryMap::System(mem.lock()),
            Memory::DmaBuf(mem) => MemoryMap::Mapped {
                mapping: mem.dmabuf.map(mem.offset + mem.size)?,
                range: mem.offset..mem.offset + mem.size,
            },
            Memory::Kms(mem) => {
                let mapping = mem.map()?;
                let size = mapping.len();
                MemoryMap::Mapped {
                    mapping,
                    range: 0..size,
                }
            }
        })
    }
}

/// CPU view of a [`Memory`]
#[derive(Debug)]
pub enum MemoryMap<'a> {
    /// Locked system memory
    System(MutexGuard<'a, Vec<u8>>),
    /// Shared mapping of a device or dma-buf memory
    Mapped {
        /// The mapping
        mapping: Mapping,
        /// Part of the mapping belonging to the memory
        range: Range<usize>,
    },
}

impl MemoryMap<'_> {
    /// Mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        match self {
            MemoryMap::System(data) => data.as_slice(),
            MemoryMap::Mapped { mapping, range } => &mapping.as_slice()[range.clone()],
        }
    }

    /// Mapped bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            MemoryMap::System(data) => data.as_mut_slice(),
            MemoryMap::Mapped { mapping, range } => &mut mapping.as_mut_slice()[range.clone()],
        }
    }
}

/// Describes how frame planes are laid out inside a buffer, overriding [`VideoInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMeta {
    /// Pixel format
    pub format: VideoFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Byte offset of each plane inside the buffer
    pub offsets: [usize; MAX_PLANES],
    /// Bytes per row of each plane
    pub strides: [u32; MAX_PLANES],
}

impl VideoMeta {
    /// Meta matching the default layout of `info`
    pub fn from_info(info: &VideoInfo) -> VideoMeta {
        VideoMeta {
            format: info.format,
            width: info.width,
            height: info.height,
            offsets: info.offsets,
            strides: info.strides,
        }
    }

    /// Number of planes
    pub fn n_planes(&self) -> usize {
        self.format.n_planes()
    }
}

/// Region of the frame that should be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropMeta {
    /// Left edge in pixels
    pub x: u32,
    /// Top edge in pixels
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

#[derive(Debug)]
struct BufferInner {
    memories: SmallVec<[Memory; MAX_PLANES]>,
    video_meta: Option<VideoMeta>,
    crop_meta: Option<CropMeta>,
    pts: Option<Duration>,
    parent: Option<VideoBuffer>,
    _slot: Option<Slot>,
}

/// Reference-counted video frame.
///
/// Cloning is cheap and shares memories and metadata. Buffers acquired from a
/// [`BufferPool`](crate::backend::allocator::BufferPool) return to it once the last
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct VideoBuffer(Arc<BufferInner>);

impl VideoBuffer {
    /// Start building a new buffer
    pub fn builder() -> VideoBufferBuilder {
        VideoBufferBuilder::default()
    }

    /// Buffer made of a single memory
    pub fn from_memory(memory: Memory) -> VideoBuffer {
        VideoBuffer::builder().memory(memory).build()
    }

    /// Memories in order
    pub fn memories(&self) -> &[Memory] {
        &self.0.memories
    }

    /// Number of memories
    pub fn n_memory(&self) -> usize {
        self.0.memories.len()
    }

    /// Memory at `index`
    pub fn memory(&self, index: usize) -> Option<&Memory> {
        self.0.memories.get(index)
    }

    /// Total size of all memories
    pub fn size(&self) -> usize {
        self.0.memories.iter().map(Memory::size).sum()
    }

    /// Locate the memory holding byte `offset` of the buffer.
    ///
    /// Returns the memory index and the offset relative to the start of that memory.
    pub fn find_memory(&self, offset: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (idx, memory) in self.0.memories.iter().enumerate() {
            let size = memory.size();
            if offset < start + size {
                return Some((idx, offset - start));
            }
            start += size;
        }
        None
    }

    /// Plane layout meta
    pub fn video_meta(&self) -> Option<&VideoMeta> {
        self.0.video_meta.as_ref()
    }

    /// Crop meta
    pub fn crop_meta(&self) -> Option<&CropMeta> {
        self.0.crop_meta.as_ref()
    }

    /// Presentation timestamp
    pub fn pts(&self) -> Option<Duration> {
        self.0.pts
    }

    /// The buffer this one was derived from
    pub fn parent(&self) -> Option<&VideoBuffer> {
        self.0.parent.as_ref()
    }

    /// Whether both handles refer to the same buffer
    pub fn ptr_eq(&self, other: &VideoBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Map all memories for CPU access
    pub fn map(&self) -> Result<BufferMap<'_>, MapError> {
        let mut maps = SmallVec::new();
        let mut starts = SmallVec::new();
        let mut start = 0;
        for memory in self.0.memories.iter() {
            let map = memory.map()?;
            starts.push(start);
            start += map.as_slice().len();
            maps.push(map);
        }
        Ok(BufferMap { maps, starts })
    }
}

/// CPU view of all memories of a buffer, addressed by buffer offset.
#[derive(Debug)]
pub struct BufferMap<'a> {
    maps: SmallVec<[MemoryMap<'a>; MAX_PLANES]>,
    starts: SmallVec<[usize; MAX_PLANES]>,
}

impl BufferMap<'_> {
    fn locate(&self, offset: usize, len: usize) -> Option<(usize, Range<usize>)> {
        let idx = self.starts.iter().rposition(|&start| start <= offset)?;
        let local = offset - self.starts[idx];
        let end = local.checked_add(len)?;
        (end <= self.maps[idx].as_slice().len()).then_some((idx, local..end))
    }

    /// `len` bytes at `offset`, if they lie within a single memory
    pub fn range(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let (idx, range) = self.locate(offset, len)?;
        Some(&self.maps[idx].as_slice()[range])
    }

    /// Writable `len` bytes at `offset`, if they lie within a single memory
    pub fn range_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let (idx, range) = self.locate(offset, len)?;
        Some(&mut self.maps[idx].as_mut_slice()[range])
    }
}

/// Builder for [`VideoBuffer`]
#[derive(Debug, Default)]
pub struct VideoBufferBuilder {
    memories: SmallVec<[Memory; MAX_PLANES]>,
    video_meta: Option<VideoMeta>,
    crop_meta: Option<CropMeta>,
    pts: Option<Duration>,
    parent: Option<VideoBuffer>,
    slot: Option<Slot>,
}

impl VideoBufferBuilder {
    /// Append a memory
    pub fn memory(mut self, memory: Memory) -> Self {
        self.memories.push(memory);
        self
    }

    /// Attach a video meta
    pub fn video_meta(mut self, meta: VideoMeta) -> Self {
        self.video_meta = Some(meta);
        self
    }

    /// Attach a crop meta
    pub fn crop_meta(mut self, meta: CropMeta) -> Self {
        self.crop_meta = Some(meta);
        self
    }

    /// Set the presentation timestamp
    pub fn pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Copy timestamp and crop meta of `other`
    pub fn metadata_from(mut self, other: &VideoBuffer) -> Self {
        self.pts = other.pts();
        self.crop_meta = other.crop_meta().copied();
        self
    }

    /// Keep `parent` alive for as long as the new buffer lives
    pub fn parent(mut self, parent: VideoBuffer) -> Self {
        self.parent = Some(parent);
        self
    }

    pub(crate) fn slot(mut self, slot: Slot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Finish the buffer
    pub fn build(self) -> VideoBuffer {
        VideoBuffer(Arc::new(BufferInner {
            memories: self.memories,
            video_meta: self.video_meta,
            crop_meta: self.crop_meta,
            pts: self.pts,
            parent: self.parent,
            _slot: self.slot,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_memory_buffer() -> VideoBuffer {
        VideoBuffer::builder()
            .memory(Memory::System(SystemMemory::from_vec(vec![1; 100])))
            .memory(Memory::System(SystemMemory::from_vec(vec![2; 50])))
            .build()
    }

    #[test]
    fn find_memory_by_offset() {
        let buffer = two_memory_buffer();
        assert_eq!(buffer.size(), 150);
        assert_eq!(buffer.find_memory(0), Some((0, 0)));
        assert_eq!(buffer.find_memory(99), Some((0, 99)));
        assert_eq!(buffer.find_memory(100), Some((1, 0)));
        assert_eq!(buffer.find_memory(120), Some((1, 20)));
        assert_eq!(buffer.find_memory(150), None);
    }

    #[test]
    fn map_ranges_stay_inside_one_memory() {
        let buffer = two_memory_buffer();
        let mut map = buffer.map().unwrap();
        assert_eq!(map.range(98, 2), Some(&[1u8, 1][..]));
        assert!(map.range(99, 2).is_none());
        map.range_mut(100, 1).unwrap()[0] = 7;
        drop(map);
        let map = buffer.map().unwrap();
        assert_eq!(map.range(100, 2), Some(&[7u8, 2][..]));
    }

    #[test]
    fn metadata_is_copied() {
        let crop = CropMeta {
            x: 8,
            y: 4,
            width: 16,
            height: 16,
        };
        let source = VideoBuffer::builder()
            .pts(Duration::from_millis(40))
            .crop_meta(crop)
            .build();
        let copy = VideoBuffer::builder().metadata_from(&source).parent(source.clone()).build();
        assert_eq!(copy.pts(), Some(Duration::from_millis(40)));
        assert_eq!(copy.crop_meta(), Some(&crop));
        assert!(copy.parent().unwrap().ptr_eq(&source));
    }
}
