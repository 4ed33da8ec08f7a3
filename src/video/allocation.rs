//! Allocation negotiation between peers.

use super::caps::VideoCaps;
use crate::backend::allocator::KmsBufferPool;

/// Metadata a peer is able to handle on buffers it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationMeta {
    /// [`VideoMeta`](super::buffer::VideoMeta)
    Video,
    /// [`CropMeta`](super::buffer::CropMeta)
    Crop,
}

/// A pool entry of an [`AllocationQuery`]
#[derive(Debug, Clone)]
pub struct AllocationPool {
    /// Pool to allocate from, `None` if the peer should allocate plain memory itself
    pub pool: Option<KmsBufferPool>,
    /// Size of each buffer in bytes
    pub size: usize,
    /// Buffers the pool keeps around
    pub min_buffers: u32,
    /// Upper limit of buffers, 0 for unlimited
    pub max_buffers: u32,
}

/// Query exchanged to agree on buffer pools and metadata for given caps.
#[derive(Debug, Clone)]
pub struct AllocationQuery {
    caps: VideoCaps,
    need_pool: bool,
    pools: Vec<AllocationPool>,
    metas: Vec<AllocationMeta>,
}

impl AllocationQuery {
    /// New query for `caps`. `need_pool` asks the answering side to provide a pool.
    pub fn new(caps: VideoCaps, need_pool: bool) -> AllocationQuery {
        AllocationQuery {
            caps,
            need_pool,
            pools: Vec::new(),
            metas: Vec::new(),
        }
    }

    /// Caps the allocation is for
    pub fn caps(&self) -> &VideoCaps {
        &self.caps
    }

    /// Whether a pool was requested
    pub fn need_pool(&self) -> bool {
        self.need_pool
    }

    /// Proposed pools in order of preference
    pub fn pools(&self) -> &[AllocationPool] {
        &self.pools
    }

    /// Append a pool proposal
    pub fn add_pool(&mut self, pool: AllocationPool) {
        self.pools.push(pool);
    }

    /// Replace the first pool proposal, or add one if there is none
    pub fn set_first_pool(&mut self, pool: AllocationPool) {
        match self.pools.first_mut() {
            Some(first) => *first = pool,
            None => self.pools.push(pool),
        }
    }

    /// Advertised metas
    pub fn metas(&self) -> &[AllocationMeta] {
        &self.metas
    }

    /// Advertise support for a meta
    pub fn add_meta(&mut self, meta: AllocationMeta) {
        if !self.metas.contains(&meta) {
            self.metas.push(meta);
        }
    }

    /// Whether a meta was advertised
    pub fn has_meta(&self, meta: AllocationMeta) -> bool {
        self.metas.contains(&meta)
    }
}
