//! The KMS device abstraction the compositor programs.
//!
//! [`KmsDevice`] is an object-id based view of a DRM node: it exposes exactly the
//! ioctls the writeback compositor needs, with plain data types in and out.
//! [`DrmDevice`] implements it on top of [`drm`]/[`drm_ffi`]; the
//! [`DummyKmsDevice`](test::DummyKmsDevice) scripts a writeback-capable device for tests.

use std::{
    ffi::CString,
    fmt, io,
    os::unix::io::{BorrowedFd, OwnedFd},
    path::PathBuf,
    time::Duration,
};

use crate::utils::Mapping;

pub(crate) mod atomic;
#[cfg(feature = "backend_drm")]
mod drm;
#[cfg(feature = "backend_drm")]
pub(crate) mod fd;

pub use self::atomic::{AtomicCommitFlags, AtomicRequest, PropertyEntry, PropertyMap};
#[cfg(feature = "backend_drm")]
pub use self::drm::DrmDevice;
#[cfg(feature = "backend_drm")]
pub use self::fd::{is_drm_device, DrmDeviceFd, DRIVER_PROBE_LIST};

/// `DRM_MODE_CONNECTOR_WRITEBACK`
pub const CONNECTOR_TYPE_WRITEBACK: u32 = 18;
/// `DRM_PLANE_TYPE_OVERLAY`
pub const PLANE_TYPE_OVERLAY: u64 = 0;
/// `DRM_PLANE_TYPE_PRIMARY`
pub const PLANE_TYPE_PRIMARY: u64 = 1;
/// `DRM_PLANE_TYPE_CURSOR`
pub const PLANE_TYPE_CURSOR: u64 = 2;
/// `DRM_PRIME_CAP_IMPORT`
pub const PRIME_CAP_IMPORT: u64 = 0x1;
/// `DRM_PRIME_CAP_EXPORT`
pub const PRIME_CAP_EXPORT: u64 = 0x2;

/// A mode-object of a device, used to query its properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    /// A connector
    Connector(u32),
    /// A crtc
    Crtc(u32),
    /// A plane
    Plane(u32),
}

impl ObjectId {
    /// Raw object id
    pub fn id(&self) -> u32 {
        match *self {
            ObjectId::Connector(id) | ObjectId::Crtc(id) | ObjectId::Plane(id) => id,
        }
    }
}

/// Name and version of the kernel driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Driver name, e.g. `vc4`
    pub name: String,
    /// `(major, minor, patchlevel)`
    pub version: (i32, i32, i32),
    /// Human readable description
    pub description: String,
}

/// Capabilities a driver may report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCapability {
    /// `DRM_CAP_DUMB_BUFFER`
    DumbBuffer,
    /// `DRM_CAP_PRIME`, a mask of [`PRIME_CAP_IMPORT`] and [`PRIME_CAP_EXPORT`]
    Prime,
    /// `DRM_CAP_ASYNC_PAGE_FLIP`
    AsyncPageFlip,
}

/// Capabilities a client has to opt in to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCapability {
    /// `DRM_CLIENT_CAP_UNIVERSAL_PLANES`
    UniversalPlanes,
    /// `DRM_CLIENT_CAP_ATOMIC`
    Atomic,
    /// `DRM_CLIENT_CAP_WRITEBACK_CONNECTORS`
    WritebackConnectors,
}

/// Mode-setting resources of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    /// Connector ids
    pub connectors: Vec<u32>,
    /// Crtc ids, the index of a crtc is its pipe
    pub crtcs: Vec<u32>,
    /// Smallest supported framebuffer width
    pub min_width: u32,
    /// Largest supported framebuffer width
    pub max_width: u32,
    /// Smallest supported framebuffer height
    pub min_height: u32,
    /// Largest supported framebuffer height
    pub max_height: u32,
}

/// A display mode, laid out like `drm_mode_modeinfo`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Mode {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub mode_type: u32,
    pub name: String,
}

impl Mode {
    /// `(hdisplay, vdisplay)`
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    /// Mode name as a C string, truncated to the 31 bytes the kernel keeps
    pub(crate) fn c_name(&self) -> CString {
        let bytes: Vec<u8> = self
            .name
            .bytes()
            .take_while(|&b| b != 0)
            .take(31)
            .collect();
        CString::new(bytes).unwrap_or_default()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

/// Connector state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Connector id
    pub id: u32,
    /// `DRM_MODE_CONNECTOR_*`
    pub connector_type: u32,
    /// Encoder currently driving the connector
    pub current_encoder: Option<u32>,
    /// Encoders able to drive the connector
    pub encoders: Vec<u32>,
    /// Supported modes
    pub modes: Vec<Mode>,
}

impl ConnectorInfo {
    /// Whether this is a writeback connector
    pub fn is_writeback(&self) -> bool {
        self.connector_type == CONNECTOR_TYPE_WRITEBACK
    }
}

/// Encoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Encoder id
    pub id: u32,
    /// Crtc currently attached
    pub crtc: Option<u32>,
    /// Bitmask of crtc indices the encoder can be attached to
    pub possible_crtcs: u32,
}

/// Crtc state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcInfo {
    /// Crtc id
    pub id: u32,
    /// Framebuffer currently scanned out
    pub framebuffer: Option<u32>,
}

/// Plane state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Plane id
    pub id: u32,
    /// Bitmask of crtc indices the plane can be used with
    pub possible_crtcs: u32,
    /// Supported fourcc codes
    pub formats: Vec<u32>,
}

/// Property metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property id
    pub id: u32,
    /// Property name
    pub name: String,
    /// Whether the property is read-only
    pub immutable: bool,
}

/// A dumb buffer freshly created by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbHandle {
    /// GEM handle
    pub handle: u32,
    /// Bytes per row
    pub pitch: u32,
    /// Total size in bytes
    pub size: u64,
}

/// Parameters of `DRM_IOCTL_MODE_ADDFB2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// fourcc code
    pub fourcc: u32,
    /// GEM handle per plane, 0 for unused planes
    pub handles: [u32; 4],
    /// Pitch per plane
    pub pitches: [u32; 4],
    /// Offset per plane
    pub offsets: [u32; 4],
}

/// Events read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// `DRM_EVENT_FLIP_COMPLETE`
    FlipComplete {
        /// Crtc the flip happened on, 0 on old kernels
        crtc_id: u32,
        /// Vblank sequence
        sequence: u32,
    },
    /// `DRM_EVENT_VBLANK`
    Vblank {
        /// Crtc the vblank happened on
        crtc_id: u32,
        /// Vblank sequence
        sequence: u32,
    },
    /// Any other event type
    Other(u32),
}

/// An open KMS device.
///
/// All methods map onto a single ioctl (or a small fixed sequence of them) and report
/// the raw OS error. Implementations must be usable from multiple threads.
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node, if known
    fn dev_path(&self) -> Option<PathBuf>;
    /// Driver name and version
    fn driver(&self) -> io::Result<DriverInfo>;
    /// Query a driver capability
    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64>;
    /// Opt in to a client capability
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;

    /// Connectors, crtcs and framebuffer limits
    fn resources(&self) -> io::Result<Resources>;
    /// All plane ids
    fn plane_handles(&self) -> io::Result<Vec<u32>>;
    /// Connector state
    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;
    /// Encoder state
    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;
    /// Crtc state
    fn crtc(&self, id: u32) -> io::Result<CrtcInfo>;
    /// Plane state
    fn plane(&self, id: u32) -> io::Result<PlaneInfo>;
    /// `(property id, current value)` pairs of an object, in driver order
    fn properties(&self, object: ObjectId) -> io::Result<Vec<(u32, u64)>>;
    /// Property name and flags
    fn property(&self, id: u32) -> io::Result<PropertyInfo>;
    /// Contents of a blob
    fn property_blob(&self, blob_id: u64) -> io::Result<Vec<u8>>;
    /// Upload `mode` as a blob, returning its id
    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64>;
    /// Destroy a blob created by [`KmsDevice::create_mode_blob`]
    fn destroy_property_blob(&self, blob_id: u64) -> io::Result<()>;

    /// Create a dumb buffer
    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbHandle>;
    /// Destroy a dumb buffer
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;
    /// Map the first `len` bytes of a dumb buffer
    fn map_dumb(&self, handle: u32, len: usize) -> io::Result<Mapping>;
    /// Register a framebuffer, returning its id
    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32>;
    /// Unregister a framebuffer
    fn destroy_framebuffer(&self, fb_id: u32) -> io::Result<()>;
    /// Import a dma-buf, returning a GEM handle
    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    /// Export a GEM handle as dma-buf
    fn prime_export(&self, handle: u32) -> io::Result<OwnedFd>;
    /// Close a GEM handle obtained by [`KmsDevice::prime_import`]
    fn close_handle(&self, handle: u32) -> io::Result<()>;

    /// Submit an atomic request.
    ///
    /// If the request carries a `WRITEBACK_OUT_FENCE_PTR` pointing at
    /// [`AtomicRequest::out_fence_ptr`], the driver stores the writeback fence there.
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &mut AtomicRequest) -> io::Result<()>;
    /// Wait up to `timeout` for the device to become readable and read pending events.
    ///
    /// Returns an empty list if nothing arrived in time.
    fn receive_events(&self, timeout: Duration) -> io::Result<Vec<DeviceEvent>>;
}

/// Wait up to `timeout` for `fd` to become readable
pub fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    use rustix::event::{poll, PollFd, PollFlags};

    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let ready = rustix::io::retry_on_intr(|| poll(&mut fds, millis))?;
    Ok(ready > 0 && fds[0].revents().contains(PollFlags::IN))
}
