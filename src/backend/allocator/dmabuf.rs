//! Module for [dmabuf](https://01.org/linuxgraphics/gfx-docs/drm/driver-api/dma-buf.html) buffers.
//!
//! `Dmabuf`s act alike to smart pointers and can be freely cloned and passed around.
//! Once the last `Dmabuf` reference is dropped, its file descriptor is closed and
//! underlying resources are freed.
//!
//! If you want to hold on to a potentially alive dmabuf without blocking the free up
//! of the underlying resources, you may `downgrade` a `Dmabuf` reference to a `WeakDmabuf`.
//! This is what the import cache of the [`KmsAllocator`](crate::backend::drm::KmsAllocator)
//! keys its entries by.

use std::{
    hash::{Hash, Hasher},
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::{Arc, Weak},
};

use rustix::fs::SeekFrom;

use crate::utils::Mapping;

#[derive(Debug)]
pub(crate) struct DmabufInternal {
    fd: OwnedFd,
    size: usize,
}

#[derive(Debug, Clone)]
/// Strong reference to a dmabuf handle
pub struct Dmabuf(pub(crate) Arc<DmabufInternal>);

#[derive(Debug, Clone)]
/// Weak reference to a dmabuf handle
pub struct WeakDmabuf(pub(crate) Weak<DmabufInternal>);

impl PartialEq for Dmabuf {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Dmabuf {}

impl PartialEq for WeakDmabuf {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WeakDmabuf {}

impl Hash for Dmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}
impl Hash for WeakDmabuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_ptr().hash(state)
    }
}

impl AsFd for Dmabuf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl Dmabuf {
    /// Wrap a dma-buf file descriptor of known size
    pub fn new(fd: OwnedFd, size: usize) -> Dmabuf {
        Dmabuf(Arc::new(DmabufInternal { fd, size }))
    }

    /// Wrap a dma-buf file descriptor, querying its size from the kernel
    pub fn from_fd(fd: OwnedFd) -> io::Result<Dmabuf> {
        let size = rustix::fs::seek(&fd, SeekFrom::End(0))?;
        rustix::fs::seek(&fd, SeekFrom::Start(0))?;
        Ok(Dmabuf::new(fd, size as usize))
    }

    /// Size of the buffer in bytes
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Raw file descriptor, only valid as long as this `Dmabuf` is alive
    pub fn raw_fd(&self) -> i32 {
        self.0.fd.as_raw_fd()
    }

    /// Map the first `len` bytes for CPU access
    pub fn map(&self, len: usize) -> io::Result<Mapping> {
        Mapping::new(self.as_fd(), 0, len)
    }

    /// Create a weak reference to this dmabuf
    pub fn weak(&self) -> WeakDmabuf {
        WeakDmabuf(Arc::downgrade(&self.0))
    }
}

impl WeakDmabuf {
    /// Try to upgrade to a strong reference of this buffer.
    ///
    /// Fails if no strong references exist anymore and the handle was already closed.
    pub fn upgrade(&self) -> Option<Dmabuf> {
        self.0.upgrade().map(Dmabuf)
    }

    /// Returns true if there are not any strong references remaining
    pub fn is_gone(&self) -> bool {
        self.0.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Dmabuf;
    use rustix::fs::{ftruncate, memfd_create, MemfdFlags};

    fn memfd(size: u64) -> Dmabuf {
        let fd = memfd_create("dmabuf-test", MemfdFlags::CLOEXEC).unwrap();
        ftruncate(&fd, size).unwrap();
        Dmabuf::from_fd(fd).unwrap()
    }

    #[test]
    fn size_from_fd() {
        assert_eq!(memfd(8192).size(), 8192);
    }

    #[test]
    fn weak_identity() {
        let a = memfd(4096);
        let b = memfd(4096);
        assert_eq!(a.weak(), a.clone().weak());
        assert_ne!(a.weak(), b.weak());

        let weak = a.weak();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.is_gone());
        assert!(weak.upgrade().is_none());
    }
}
