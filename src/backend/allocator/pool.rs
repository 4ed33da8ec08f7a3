use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::{debug, trace};

use super::Allocator;
use crate::video::{Memory, VideoBuffer, VideoInfo, VideoMeta};

bitflags::bitflags! {
    /// Options a pool applies to the buffers it produces
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PoolOptions: u32 {
        /// Attach a [`VideoMeta`] describing the memory layout
        const VIDEO_META = 0x1;
        /// Export the allocated memory as dma-buf
        const PRIME_EXPORT = 0x2;
    }
}

/// Configuration of a [`BufferPool`]
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Frame layout of the produced buffers
    pub info: VideoInfo,
    /// Size in bytes a buffer must at least have
    pub size: usize,
    /// Buffers allocated on activation
    pub min_buffers: u32,
    /// Upper bound of buffers, 0 for unlimited
    pub max_buffers: u32,
    /// Options
    pub options: PoolOptions,
}

impl PoolConfig {
    /// A configuration for frames of `info`, at least `min_buffers` of them
    pub fn new(info: VideoInfo, min_buffers: u32, max_buffers: u32) -> PoolConfig {
        PoolConfig {
            size: info.size,
            info,
            min_buffers,
            max_buffers,
            options: PoolOptions::empty(),
        }
    }

    /// Add an option
    pub fn add_option(&mut self, option: PoolOptions) {
        self.options |= option;
    }

    /// Whether `option` is set
    pub fn has_option(&self, option: PoolOptions) -> bool {
        self.options.contains(option)
    }
}

/// Errors of a [`BufferPool`]
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is not active, acquire is refused
    #[error("buffer pool is inactive")]
    Inactive,
    /// The pool has no configuration
    #[error("buffer pool is not configured")]
    NotConfigured,
    /// Configuration can not be changed while the pool is active
    #[error("buffer pool is active")]
    Active,
    /// All `max_buffers` buffers are in use
    #[error("all {0} buffers of the pool are in use")]
    Exhausted(u32),
    /// The allocator failed
    #[error("buffer allocation failed")]
    Alloc(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug)]
struct InternalSlot {
    memory: Memory,
    layout: VideoInfo,
    acquired: AtomicBool,
}

/// Slot of a pool containing an allocated memory.
///
/// The memory is marked for re-use once the slot is dropped, which happens when
/// the last clone of the [`VideoBuffer`] holding it goes away.
#[derive(Debug)]
pub struct Slot(Arc<InternalSlot>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.acquired.store(false, Ordering::SeqCst);
    }
}

struct PoolInner<A> {
    allocator: A,
    config: Option<PoolConfig>,
    active: bool,
    slots: Vec<Arc<InternalSlot>>,
}

/// Pool handing out re-usable video buffers.
///
/// Buffers return to the pool once all their clones are dropped. Deactivating
/// the pool releases all buffers that are not in use, buffers still held by a
/// consumer are freed when the consumer drops them.
pub struct BufferPool<A: Allocator>(Arc<Mutex<PoolInner<A>>>);

impl<A: Allocator> Clone for BufferPool<A> {
    fn clone(&self) -> Self {
        BufferPool(self.0.clone())
    }
}

impl<A: Allocator> fmt::Debug for BufferPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("BufferPool")
            .field("config", &inner.config)
            .field("active", &inner.active)
            .field("buffers", &inner.slots.len())
            .finish()
    }
}

impl<A: Allocator> BufferPool<A> {
    /// Create an unconfigured, inactive pool
    pub fn new(allocator: A) -> BufferPool<A> {
        BufferPool(Arc::new(Mutex::new(PoolInner {
            allocator,
            config: None,
            active: false,
            slots: Vec::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner<A>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same pool
    pub fn ptr_eq(&self, other: &BufferPool<A>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Current configuration
    pub fn config(&self) -> Option<PoolConfig> {
        self.lock().config.clone()
    }

    /// Replace the configuration, dropping all idle buffers
    pub fn set_config(&self, config: PoolConfig) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.active {
            return Err(PoolError::Active);
        }
        inner.slots.clear();
        inner.config = Some(config);
        Ok(())
    }

    /// Whether the pool hands out buffers
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Activate or deactivate the pool.
    ///
    /// Activation preallocates `min_buffers` buffers.
    pub fn set_active(&self, active: bool) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.active == active {
            return Ok(());
        }
        if !active {
            inner.active = false;
            inner.slots.clear();
            debug!("Buffer pool deactivated");
            return Ok(());
        }

        let config = inner.config.clone().ok_or(PoolError::NotConfigured)?;
        inner.slots.clear();
        for _ in 0..config.min_buffers {
            let slot = inner.allocate(&config)?;
            slot.acquired.store(false, Ordering::SeqCst);
        }
        inner.active = true;
        debug!(buffers = config.min_buffers, "Buffer pool activated");
        Ok(())
    }

    /// Acquire a free buffer, allocating a new one if all are in use
    #[profiling::function]
    pub fn acquire(&self) -> Result<VideoBuffer, PoolError> {
        let mut inner = self.lock();
        if !inner.active {
            return Err(PoolError::Inactive);
        }
        let config = inner.config.clone().ok_or(PoolError::NotConfigured)?;

        let slot = match inner
            .slots
            .iter()
            .find(|s| !s.acquired.swap(true, Ordering::SeqCst))
        {
            Some(slot) => slot.clone(),
            None => {
                if config.max_buffers != 0 && inner.slots.len() >= config.max_buffers as usize {
                    return Err(PoolError::Exhausted(config.max_buffers));
                }
                inner.allocate(&config)?
            }
        };

        let mut builder = VideoBuffer::builder().memory(slot.memory.clone());
        if config.has_option(PoolOptions::VIDEO_META) {
            builder = builder.video_meta(VideoMeta::from_info(&slot.layout));
        }
        Ok(builder.slot(Slot(slot)).build())
    }

    /// Number of buffers allocated by the pool
    pub fn buffer_count(&self) -> usize {
        self.lock().slots.len()
    }
}

impl<A: Allocator> PoolInner<A> {
    // the returned slot is marked as acquired
    fn allocate(&mut self, config: &PoolConfig) -> Result<Arc<InternalSlot>, PoolError> {
        let (memory, layout) = self
            .allocator
            .allocate(&config.info, config.options)
            .map_err(|err| PoolError::Alloc(Box::new(err)))?;
        trace!(size = memory.size(), "Allocated pool buffer");
        let slot = Arc::new(InternalSlot {
            memory,
            layout,
            acquired: AtomicBool::new(true),
        });
        self.slots.push(slot.clone());
        Ok(slot)
    }
}
