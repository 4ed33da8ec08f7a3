//! Backend helpers
//!
//! Collection of the device level building blocks the compositor is made of:
//!
//! - [`drm`]: kms devices, atomic requests and framebuffer memory
//! - [`allocator`]: dma-bufs, dumb buffers, format tables and buffer pools

pub mod allocator;
pub mod drm;
