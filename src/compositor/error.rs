use std::{io, time::Duration};

use super::CompositorState;
use crate::{
    backend::{
        allocator::PoolError,
        drm::{AccessError, AllocError},
    },
    video::{info::InvalidCaps, CopyError},
};

/// Errors thrown by the [`KmsCompositor`](super::KmsCompositor) and its pads
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unable to open the drm device
    #[error("Failed to open drm device {driver:?}: {source}")]
    DeviceOpen {
        /// Driver name or bus id the open was attempted with, `None` when probing
        driver: Option<String>,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The device lacks a capability the compositor depends on
    #[error("The drm device does not support {0}")]
    CapabilityMissing(&'static str),
    /// Reading the mode-setting resources failed
    #[error("Failed to enumerate device resources")]
    ResourceEnumerationFailed(#[source] AccessError),
    /// No writeback connector could be used
    #[error("No usable writeback connector found (requested: {requested:?})")]
    NoWritebackConnector {
        /// Connector id set by the user, if any
        requested: Option<u32>,
    },
    /// The connector has no crtc it could be driven by
    #[error("No crtc is compatible with connector {0}")]
    NoCompatibleCrtc(u32),
    /// No plane of the crtc can be used as input
    #[error("No acceptable plane found for crtc {0}")]
    NoAcceptablePlane(u32),
    /// The connector exposes no output format we can handle
    #[error("The writeback connector supports no usable format")]
    CapsUnsupported,
    /// The negotiated size matches none of the connector's modes
    #[error("No mode with size {width}x{height} available")]
    ModeUnavailable {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },
    /// The driver refused to store the mode blob
    #[error("Failed to create mode blob")]
    ModeBlobCreationFailed(#[source] AccessError),
    /// A property needed to build the commit is not exposed by the driver
    #[error("{object} {name} property is missing")]
    PropertyMissing {
        /// Object kind and id
        object: String,
        /// Property name
        name: &'static str,
    },
    /// The driver rejected the atomic commit
    #[error("Atomic commit failed")]
    AtomicCommitFailed(#[source] AccessError),
    /// The writeback fence did not signal in time
    #[error("Writeback fence did not signal within {0:?}")]
    FenceTimeout(Duration),
    /// Only flip events of other crtcs arrived before the wait timed out
    #[error("Received page flips only for unrelated crtc {0}")]
    UnexpectedFlipCrtc(u32),
    /// Acquiring an output buffer failed
    #[error("Failed to acquire output buffer")]
    OutputAllocationFailed(#[source] PoolError),
    /// Importing an input dma-buf failed
    #[error("Failed to import dma-buf")]
    ImportFailed(#[source] AllocError),
    /// The output buffer is not backed by a framebuffer
    #[error("Output buffer is not backed by a framebuffer")]
    FramebufferCreationFailed,
    /// Copying a frame on the cpu failed
    #[error("Failed to copy frame")]
    FrameCopyFailed(#[source] CopyError),
    /// There are no input pads
    #[error("No input streams configured")]
    NoInputs,
    /// The previous output frame was not yet consumed
    #[error("Previous output not processed yet")]
    OutputPending,
    /// Caps have not been negotiated
    #[error("Output caps are not negotiated")]
    NotNegotiated,
    /// A state change is not possible from the current state
    #[error("Invalid state change from {from:?} to {to:?}")]
    InvalidState {
        /// Current state
        from: CompositorState,
        /// Requested state
        to: CompositorState,
    },
    /// The compositor is not processing data
    #[error("Compositor is flushing")]
    Flushing,
    /// Caps could not be parsed
    #[error(transparent)]
    InvalidCaps(#[from] InvalidCaps),
    /// The driver accepted the commit but did not return a fence
    #[error("Driver did not set the writeback out fence")]
    FenceNotSet,
    /// No page flip event for our crtc arrived in time
    #[error("No page flip event received within {0:?}")]
    EventWaitTimeout(Duration),
    /// Reading or waiting for device events failed
    #[error("Failed to wait for device events")]
    Event(#[source] AccessError),
    /// A property could not be set or read
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Errors of the property interface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    /// There is no property of that name
    #[error("Unknown property `{0}`")]
    Unknown(String),
    /// The property can only be read
    #[error("Property `{0}` is read-only")]
    ReadOnly(&'static str),
    /// The value has the wrong type for the property
    #[error("Invalid value type for property `{0}`")]
    InvalidType(&'static str),
    /// The value lies outside of the property's range
    #[error("Value out of range for property `{0}`")]
    OutOfRange(&'static str),
}
