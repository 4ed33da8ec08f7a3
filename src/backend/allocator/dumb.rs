//! Module for [DumbBuffer](https://01.org/linuxgraphics/gfx-docs/drm/gpu/drm-kms.html#dumb-buffer-objects) buffers

use std::{fmt, io, os::unix::io::OwnedFd, sync::Arc};

use tracing::warn;

use crate::backend::drm::{DumbHandle, KmsDevice};
use crate::utils::Mapping;

/// Wrapper around raw DumbBuffer handles.
///
/// The buffer is destroyed once the wrapper is dropped.
pub struct DumbBuffer {
    device: Arc<dyn KmsDevice>,
    handle: DumbHandle,
    width: u32,
    height: u32,
    bpp: u32,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("handle", &self.handle.handle)
            .field("pitch", &self.handle.pitch)
            .field("size", &(self.width, self.height))
            .field("bpp", &self.bpp)
            .finish()
    }
}

impl DumbBuffer {
    /// Create a `width`x`height` buffer of `bpp` bits per pixel
    pub fn create(device: Arc<dyn KmsDevice>, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let handle = device.create_dumb(width, height, bpp)?;
        Ok(DumbBuffer {
            device,
            handle,
            width,
            height,
            bpp,
        })
    }

    /// Raw GEM handle of the buffer.
    ///
    /// Note: This handle will become invalid, once the `DumbBuffer` wrapper is dropped
    /// or the device used to create is closed. Do not copy this handle and assume it keeps being valid.
    pub fn handle(&self) -> u32 {
        self.handle.handle
    }

    /// Bytes per row as chosen by the driver
    pub fn pitch(&self) -> u32 {
        self.handle.pitch
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.handle.size as usize
    }

    /// `(width, height)` the buffer was created with
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Map the whole buffer
    pub fn map(&self) -> io::Result<Mapping> {
        self.device.map_dumb(self.handle.handle, self.size())
    }

    /// Export the buffer as dma-buf
    pub fn export(&self) -> io::Result<OwnedFd> {
        self.device.prime_export(self.handle.handle)
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_dumb(self.handle.handle) {
            warn!(handle = self.handle.handle, ?err, "Failed to destroy dumb buffer");
        }
    }
}
