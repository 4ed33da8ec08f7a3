//! Buffer allocation and management.
//!
//! Collection of common traits and implementations around
//! buffer creation and handling from various sources.
//!
//! Allocators provided:
//! - Dumb buffers registered as framebuffers through [`KmsAllocator`](crate::backend::drm::KmsAllocator)
//! - Plain CPU memory through [`SystemAllocator`]
//!
//! Buffer types supported:
//! - [DumbBuffers](dumb::DumbBuffer)
//! - [DmaBufs](dmabuf::Dmabuf)
//!
//! Helpers:
//! - [`BufferPool`] to re-use buffers between frames

pub mod dmabuf;
pub mod dumb;
pub mod format;
mod pool;

pub use pool::{BufferPool, PoolConfig, PoolError, PoolOptions, Slot};

pub use drm_fourcc::{DrmFourcc as Fourcc, UnrecognizedFourcc};

use crate::{
    backend::drm::{AllocError, KmsAllocator},
    video::{Memory, SystemMemory, VideoInfo},
};

/// Interface to create memories for video frames
pub trait Allocator {
    /// Error type thrown if allocations fail
    type Error: std::error::Error + Send + Sync + 'static;

    /// Allocate memory for a frame of `info`.
    ///
    /// Returns the memory together with the plane layout the frame has inside it.
    fn allocate(&mut self, info: &VideoInfo, options: PoolOptions) -> Result<(Memory, VideoInfo), Self::Error>;
}

impl Allocator for KmsAllocator {
    type Error = AllocError;

    fn allocate(&mut self, info: &VideoInfo, options: PoolOptions) -> Result<(Memory, VideoInfo), AllocError> {
        let memory = self.alloc_dumb(info, options.contains(PoolOptions::PRIME_EXPORT))?;
        let layout = memory.info().clone();
        Ok((Memory::Kms(memory), layout))
    }
}

/// Allocator of plain CPU memory, laid out as [`VideoInfo::new`] describes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    type Error = std::convert::Infallible;

    fn allocate(
        &mut self,
        info: &VideoInfo,
        _options: PoolOptions,
    ) -> Result<(Memory, VideoInfo), Self::Error> {
        Ok((Memory::System(SystemMemory::new(info.size)), info.clone()))
    }
}

/// Pool of framebuffer-backed buffers
pub type KmsBufferPool = BufferPool<KmsAllocator>;

/// Pool of CPU memory buffers
pub type SystemBufferPool = BufferPool<SystemAllocator>;
