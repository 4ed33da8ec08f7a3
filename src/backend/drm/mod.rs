//! Drm/Kms types and backend implementations
//!
//! This module provides the [`KmsDevice`] trait, an id based view of a drm node
//! exposing the ioctls needed to drive a writeback connector, and [`DrmDevice`],
//! its implementation for real hardware.
//!
//! ## How to use it
//!
//! ### Initialization
//!
//! A [`DrmDeviceFd`] is opened either by driver name and/or bus id, by probing
//! [`DRIVER_PROBE_LIST`], or adopted from an already open file descriptor.
//! It tries to become drm master and releases the lock again on drop.
//!
//! ```rust,no_run
//! use kms_compositor::backend::drm::{DrmDevice, DrmDeviceFd, KmsDevice};
//!
//! let fd = DrmDeviceFd::open(Some("vc4"), None).expect("no vc4 device");
//! let device = DrmDevice::new(fd);
//! let resources = device.resources().expect("failed to query resources");
//! println!("{} connectors", resources.connectors.len());
//! ```
//!
//! ### Memory
//!
//! Buffers scanned out by planes or written by the writeback connector are
//! [`KmsMemory`]s, created by a [`KmsAllocator`] either as dumb buffers or from
//! imported dma-bufs.
//!
//! ### Atomic commits
//!
//! Commits are built into an [`AtomicRequest`], four parallel arrays that are
//! reused between frames. Properties are addressed by ids, which can be looked up
//! by name through a [`PropertyMap`].

pub(crate) mod device;
pub(crate) mod error;
pub mod memory;

pub use device::*;
pub use error::AccessError;
pub use memory::{AllocError, KmsAllocator, KmsMemory};
