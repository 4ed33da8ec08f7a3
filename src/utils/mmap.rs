//! Shared CPU mappings of device and dma-buf memory.

use std::{
    fmt,
    io,
    os::unix::io::BorrowedFd,
    ptr::{self, NonNull},
};

use rustix::mm::{MapFlags, ProtFlags};

/// A read-write `MAP_SHARED` mapping, unmapped on drop.
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory owned by this struct; aliasing is governed by `&`/`&mut`.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Mapping {
    /// Maps `len` bytes of `fd` starting at `offset`.
    ///
    /// `offset` must be page-aligned. A zero-sized request yields an empty mapping
    /// without touching the kernel.
    pub fn new(fd: BorrowedFd<'_>, offset: u64, len: usize) -> io::Result<Mapping> {
        if len == 0 {
            return Ok(Mapping {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        // SAFETY: we request a fresh mapping at a kernel-chosen address,
        // nothing else can observe the memory before we return it.
        let ptr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };

        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| Mapping { ptr, len })
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null pointer"))
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we hold the only reference
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        // SAFETY: ptr/len describe a mapping created in `Mapping::new`
        if let Err(err) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(?err, len = self.len, "failed to unmap memory");
        }
    }
}
