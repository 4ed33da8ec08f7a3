//! Framebuffer-backed memory.
//!
//! A [`KmsMemory`] is a buffer registered as framebuffer on a [`KmsDevice`]. It is either
//! a dumb buffer allocated by the device (optionally PRIME-exported) or a set of imported
//! dma-bufs. The framebuffer is unregistered before the backing storage is released.
//!
//! [`KmsAllocator`] creates both kinds and keeps a cache of imports keyed by the
//! identity of the source dma-buf, so an upstream buffer that is submitted every frame
//! is only registered once.

use std::{
    collections::HashMap,
    fmt, io,
    os::unix::io::AsFd,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::{
    error::{AccessContext, AccessError},
    FramebufferDesc, KmsDevice,
};
use crate::{
    backend::allocator::{
        dmabuf::{Dmabuf, WeakDmabuf},
        dumb::DumbBuffer,
        format::{get_dumb_bpp, get_dumb_height, get_fourcc},
    },
    utils::Mapping,
    video::{format::subsampled, VideoInfo},
};

/// Errors of the [`KmsAllocator`]
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The driver refused to create a dumb buffer
    #[error("failed to create dumb buffer")]
    Dumb(#[source] AccessError),
    /// The dumb buffer is smaller than the frame layout requires
    #[error("dumb buffer of {size} bytes is too small for a frame of {needed} bytes")]
    TooSmall {
        /// Bytes the layout needs
        needed: usize,
        /// Bytes the driver gave us
        size: usize,
    },
    /// Registering the framebuffer failed
    #[error("failed to create framebuffer")]
    Framebuffer(#[source] AccessError),
    /// Importing a dma-buf failed
    #[error("failed to import dma-buf")]
    Import(#[source] AccessError),
    /// Exporting a dumb buffer failed
    #[error("failed to export dumb buffer")]
    Export(#[source] AccessError),
    /// The import request is malformed
    #[error("invalid import of {planes} planes for {format}")]
    InvalidImport {
        /// Number of planes passed
        planes: usize,
        /// Format of the frame
        format: crate::video::VideoFormat,
    },
}

enum Backing {
    Dumb(DumbBuffer),
    Imported {
        handles: SmallVec<[u32; 4]>,
        sources: SmallVec<[WeakDmabuf; 4]>,
    },
}

struct KmsMemoryInner {
    device: Arc<dyn KmsDevice>,
    fb_id: u32,
    info: VideoInfo,
    size: usize,
    dmabuf: Option<Dmabuf>,
    backing: Backing,
}

impl Drop for KmsMemoryInner {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_framebuffer(self.fb_id) {
            warn!(fb = self.fb_id, ?err, "Failed to remove framebuffer");
        }
        if let Backing::Imported { handles, .. } = &self.backing {
            close_handles(&*self.device, handles);
        }
        // the dumb buffer is destroyed when `backing` drops
    }
}

// several planes of one dma-buf share a handle, each handle is closed once
fn close_handles(device: &dyn KmsDevice, handles: &[u32]) {
    for (i, &handle) in handles.iter().enumerate() {
        if handles[..i].contains(&handle) {
            continue;
        }
        if let Err(err) = device.close_handle(handle) {
            warn!(handle, ?err, "Failed to close imported handle");
        }
    }
}

/// Memory registered as framebuffer on a KMS device.
///
/// Clones share the registration, which is removed once the last clone is dropped.
#[derive(Clone)]
pub struct KmsMemory(Arc<KmsMemoryInner>);

impl fmt::Debug for KmsMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsMemory")
            .field("fb_id", &self.0.fb_id)
            .field("size", &self.0.size)
            .field("dumb", &matches!(self.0.backing, Backing::Dumb(_)))
            .field("exported", &self.0.dmabuf.is_some())
            .finish()
    }
}

impl PartialEq for KmsMemory {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl KmsMemory {
    /// Framebuffer id, valid as long as this memory is alive
    pub fn fb_id(&self) -> u32 {
        self.0.fb_id
    }

    /// Size of the frame in bytes
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Plane layout of the framebuffer
    pub fn info(&self) -> &VideoInfo {
        &self.0.info
    }

    /// PRIME-exported handle of a dumb buffer
    pub fn dmabuf(&self) -> Option<&Dmabuf> {
        self.0.dmabuf.as_ref()
    }

    /// Whether the memory is a dumb buffer of the device
    pub fn is_dumb(&self) -> bool {
        matches!(self.0.backing, Backing::Dumb(_))
    }

    /// Map the memory for CPU access
    pub fn map(&self) -> io::Result<Mapping> {
        match &self.0.backing {
            Backing::Dumb(buffer) => buffer.map(),
            Backing::Imported { sources, .. } => sources
                .first()
                .and_then(WeakDmabuf::upgrade)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "imported dma-buf is gone"))?
                .map(self.0.size),
        }
    }
}

/// Plane layout of a frame stored in a single dumb buffer with the given pitch
fn dumb_layout(info: &VideoInfo, pitch: u32) -> VideoInfo {
    let mut layout = info.clone();
    let planes = info.format.planes();
    let mut offset = 0;
    for (i, plane) in planes.iter().enumerate() {
        let stride = (pitch * plane.pstride / planes[0].pstride) >> plane.xshift;
        layout.strides[i] = stride;
        layout.offsets[i] = offset;
        offset += stride as usize * subsampled(info.height, plane.yshift) as usize;
    }
    layout.size = offset;
    layout
}

struct AllocatorInner {
    device: Arc<dyn KmsDevice>,
    cache: Mutex<HashMap<(WeakDmabuf, usize), KmsMemory>>,
}

/// Allocator of [`KmsMemory`]
#[derive(Clone)]
pub struct KmsAllocator(Arc<AllocatorInner>);

impl fmt::Debug for KmsAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsAllocator")
            .field("device", &self.0.device)
            .field("cached", &self.cache().len())
            .finish()
    }
}

impl KmsAllocator {
    /// Allocator for `device`
    pub fn new(device: Arc<dyn KmsDevice>) -> KmsAllocator {
        KmsAllocator(Arc::new(AllocatorInner {
            device,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    /// The device memories are allocated on
    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.0.device
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(WeakDmabuf, usize), KmsMemory>> {
        self.0.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_framebuffer(&self, info: &VideoInfo, handles: &[u32], offsets: &[usize]) -> Result<u32, AllocError> {
        let mut desc = FramebufferDesc {
            width: info.width,
            height: info.height,
            fourcc: get_fourcc(info.format) as u32,
            handles: [0; 4],
            pitches: [0; 4],
            offsets: [0; 4],
        };
        for (i, (&handle, &offset)) in handles.iter().zip(offsets).enumerate() {
            desc.handles[i] = handle;
            desc.pitches[i] = info.strides[i];
            desc.offsets[i] = offset as u32;
        }
        let device = &*self.0.device;
        device
            .add_framebuffer(&desc)
            .access("Failed to add framebuffer", device)
            .map_err(AllocError::Framebuffer)
    }

    /// Allocate a dumb buffer holding a frame of `info`, registered as framebuffer.
    ///
    /// With `export` the buffer is also exported as dma-buf.
    #[profiling::function]
    pub fn alloc_dumb(&self, info: &VideoInfo, export: bool) -> Result<KmsMemory, AllocError> {
        let device = &*self.0.device;
        let format = info.format;
        let buffer = DumbBuffer::create(
            self.0.device.clone(),
            info.width,
            get_dumb_height(format, info.height),
            get_dumb_bpp(format),
        )
        .access("Failed to create dumb buffer", device)
        .map_err(AllocError::Dumb)?;

        let layout = dumb_layout(info, buffer.pitch());
        if layout.size > buffer.size() {
            return Err(AllocError::TooSmall {
                needed: layout.size,
                size: buffer.size(),
            });
        }

        let size = buffer.size();
        let dmabuf = if export {
            let fd = buffer
                .export()
                .access("Failed to export dumb buffer", device)
                .map_err(AllocError::Export)?;
            Some(Dmabuf::new(fd, size))
        } else {
            None
        };

        let planes = format.n_planes();
        let handles = [buffer.handle(); 4];
        let fb_id = self.add_framebuffer(&layout, &handles[..planes], &layout.offsets[..planes])?;
        trace!(fb_id, handle = buffer.handle(), pitch = buffer.pitch(), "Allocated dumb framebuffer");

        Ok(KmsMemory(Arc::new(KmsMemoryInner {
            device: self.0.device.clone(),
            fb_id,
            info: layout,
            size,
            dmabuf,
            backing: Backing::Dumb(buffer),
        })))
    }

    /// Wrap the dma-bufs of a frame into a framebuffer.
    ///
    /// `planes` holds the dma-buf of every plane of `info` and `skips` the offset of each
    /// plane inside its dma-buf.
    #[profiling::function]
    pub fn dmabuf_import(
        &self,
        planes: &[&Dmabuf],
        skips: &[usize],
        info: &VideoInfo,
    ) -> Result<KmsMemory, AllocError> {
        if planes.is_empty() || planes.len() != info.n_planes() || skips.len() != planes.len() {
            return Err(AllocError::InvalidImport {
                planes: planes.len(),
                format: info.format,
            });
        }

        let device = &*self.0.device;
        let mut handles = SmallVec::<[u32; 4]>::new();
        for dmabuf in planes {
            match device.prime_import(dmabuf.as_fd()) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    close_handles(device, &handles);
                    return Err(AllocError::Import(AccessError {
                        errmsg: "Failed to import dma-buf",
                        dev: device.dev_path(),
                        source,
                    }));
                }
            }
        }

        let fb_id = match self.add_framebuffer(info, &handles, skips) {
            Ok(fb_id) => fb_id,
            Err(err) => {
                close_handles(device, &handles);
                return Err(err);
            }
        };
        trace!(fb_id, ?handles, "Imported dma-buf framebuffer");
        Ok(KmsMemory(Arc::new(KmsMemoryInner {
            device: self.0.device.clone(),
            fb_id,
            info: info.clone(),
            size: info.size,
            dmabuf: None,
            backing: Backing::Imported {
                handles,
                sources: planes.iter().map(|d| d.weak()).collect(),
            },
        })))
    }

    /// Look up the memory wrapping the dma-buf region starting at `offset`.
    ///
    /// Entries whose source dma-buf is gone are treated as a miss and pruned.
    pub fn cached(&self, source: &Dmabuf, offset: usize) -> Option<KmsMemory> {
        let mut cache = self.cache();
        cache.retain(|(weak, _), _| !weak.is_gone());
        cache.get(&(source.weak(), offset)).cloned()
    }

    /// Remember `memory` as wrapper of the dma-buf region starting at `offset`
    pub fn cache_memory(&self, source: &Dmabuf, offset: usize, memory: KmsMemory) {
        let mut cache = self.cache();
        cache.retain(|(weak, _), _| !weak.is_gone());
        cache.insert((source.weak(), offset), memory);
    }

    /// Drop all cached imports
    pub fn clear_cache(&self) {
        let mut cache = self.cache();
        debug!(entries = cache.len(), "Clearing import cache");
        cache.clear();
    }

    /// Number of live cache entries
    pub fn cache_len(&self) -> usize {
        let mut cache = self.cache();
        cache.retain(|(weak, _), _| !weak.is_gone());
        cache.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AllocError, KmsAllocator};
    use crate::{
        backend::{
            allocator::dmabuf::Dmabuf,
            drm::{test::DummyKmsDevice, KmsDevice},
        },
        video::{VideoFormat, VideoInfo},
    };

    fn allocator() -> (Arc<DummyKmsDevice>, KmsAllocator) {
        let dev = DummyKmsDevice::new();
        let alloc = KmsAllocator::new(dev.clone() as Arc<dyn KmsDevice>);
        (dev, alloc)
    }

    fn memfd(size: usize) -> Dmabuf {
        let fd = rustix::fs::memfd_create("source", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        Dmabuf::from_fd(fd).unwrap()
    }

    #[test]
    fn nv12_dumb_layout() {
        let (dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Nv12, 1280, 720);
        let mem = alloc.alloc_dumb(&info, false).unwrap();
        assert_eq!(mem.info().strides[..2], [1280, 1280]);
        assert_eq!(mem.info().offsets[1], 1280 * 720);
        assert!(mem.dmabuf().is_none());

        let fb = dev.framebuffer(mem.fb_id()).unwrap();
        assert_eq!(fb.handles[0], fb.handles[1]);
        assert_eq!(fb.offsets[1], 1280 * 720);

        drop(mem);
        assert_eq!(dev.framebuffer_count(), 0);
        assert_eq!(dev.gem_count(), 0);
    }

    #[test]
    fn i420_chroma_stride() {
        let (_dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::I420, 64, 48);
        let mem = alloc.alloc_dumb(&info, false).unwrap();
        assert_eq!(mem.info().strides[..3], [64, 32, 32]);
        assert_eq!(mem.info().offsets[..3], [0, 64 * 48, 64 * 48 + 32 * 24]);
    }

    #[test]
    fn exported_dumb_is_mappable_through_dmabuf() {
        let (_dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 16);
        let mem = alloc.alloc_dumb(&info, true).unwrap();
        mem.map().unwrap().as_mut_slice()[3] = 7;
        let dmabuf = mem.dmabuf().unwrap();
        assert_eq!(dmabuf.map(16).unwrap().as_slice()[3], 7);
    }

    #[test]
    fn import_closes_shared_handle_once() {
        let (dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Nv12, 64, 48);
        let source = memfd(info.size);
        let mem = alloc
            .dmabuf_import(&[&source, &source], &[0, info.offsets[1]], &info)
            .unwrap();
        assert_eq!(dev.gem_count(), 1);
        assert_eq!(dev.framebuffer(mem.fb_id()).unwrap().offsets[1], 64 * 48);
        drop(mem);
        assert_eq!(dev.gem_count(), 0);
        assert_eq!(dev.framebuffer_count(), 0);
    }

    #[test]
    fn import_plane_count_must_match() {
        let (_dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Nv12, 64, 48);
        let source = memfd(info.size);
        assert!(matches!(
            alloc.dmabuf_import(&[&source], &[0], &info),
            Err(AllocError::InvalidImport { planes: 1, .. })
        ));
    }

    #[test]
    fn cache_misses_once_source_is_gone() {
        let (dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 16);
        let source = memfd(info.size);
        let mem = alloc.dmabuf_import(&[&source], &[0], &info).unwrap();
        alloc.cache_memory(&source, 0, mem.clone());
        assert_eq!(alloc.cached(&source, 0), Some(mem.clone()));
        assert_eq!(alloc.cached(&source, 4), None);
        assert_eq!(alloc.cache_len(), 1);
        drop(mem);

        drop(source);
        assert_eq!(alloc.cache_len(), 0);
        assert_eq!(dev.framebuffer_count(), 0);
    }

    #[test]
    fn clear_cache_releases_framebuffers() {
        let (dev, alloc) = allocator();
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 16);
        let source = memfd(info.size);
        let mem = alloc.dmabuf_import(&[&source], &[0], &info).unwrap();
        alloc.cache_memory(&source, 0, mem);
        assert_eq!(dev.framebuffer_count(), 1);
        alloc.clear_cache();
        assert_eq!(dev.framebuffer_count(), 0);
    }
}
