//! Hardware video compositor on top of a KMS writeback connector
//!
//! The [`KmsCompositor`] binds every usable plane of the crtc driving a writeback connector
//! to a [`SinkPad`]. Each aggregation tick places the current frame of every pad on its plane,
//! points the writeback connector at an output buffer and submits everything as one atomic
//! commit. The display hardware blends the planes and writes the result back into memory.
//!
//! ## How to use it
//!
//! ### Initialization
//!
//! A compositor is created from [`CompositorSettings`] and brought up through its states.
//! Going to [`CompositorState::Ready`] opens the device (by fd, driver name, bus id or by
//! probing well-known drivers), selects the connector and binds the planes:
//!
//! ```rust,no_run
//! use kms_compositor::compositor::{CompositorSettings, CompositorState, KmsCompositor};
//!
//! let mut compositor = KmsCompositor::new(CompositorSettings {
//!     driver_name: Some("vc4".into()),
//!     ..CompositorSettings::from_env()
//! });
//! compositor.set_state(CompositorState::Ready).expect("failed to open device");
//! for pad in compositor.pads() {
//!     println!("{} shows plane {}", pad.name(), pad.plane_id());
//! }
//! ```
//!
//! ### Negotiation
//!
//! Inputs announce their caps through [`SinkPad::set_caps`]. The output is negotiated with
//! [`KmsCompositor::negotiate`], which picks a configuration out of what the connector offers
//! and installs the matching mode. [`KmsCompositor::decide_allocation`] then sets up the pool
//! of writeback buffers and tells downstream whether it receives them directly or copies.
//!
//! ### Compositing
//!
//! Once [`CompositorState::Paused`] or later is reached, every call to
//! [`KmsCompositor::aggregate`] produces one composed frame out of the buffers last pushed
//! with [`SinkPad::push_buffer`]. A tick blocks until the writeback finished and the flip event
//! of our crtc was read, so at most one commit is in flight.

use std::{
    os::unix::io::{AsFd, BorrowedFd, OwnedFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, error, info, info_span, instrument, trace, warn};

mod caps;
pub mod connector;
mod error;
mod pad;
pub mod plane;
pub mod request;
mod settings;

pub use self::caps::{fixate_src_caps, DEFAULT_FRAMERATE};
pub use self::error::{Error, PropertyError};
pub use self::pad::{SinkPad, PAD_PROPERTIES};
pub use self::plane::{BlendMode, Rotation};
pub use self::request::PlaneParams;
pub use self::settings::{CompositorSettings, PropertyValue, DEBUG_COMMIT_ENV, MAX_PLANES_ENV};

use self::{
    caps::writeback_caps,
    connector::{find_mode, select_connector, WritebackConnector},
    pad::{create_kms_pool, SharedContext},
    plane::{bind_planes, PlaneBinding},
    request::{fill_request, OutputProperties, PlaneConfig, PlaneUpdate},
};
use crate::{
    backend::{
        allocator::{
            KmsBufferPool, PoolConfig, PoolError, PoolOptions, SystemAllocator, SystemBufferPool,
        },
        drm::{
            error::AccessContext, poll_readable, AtomicRequest, ClientCapability, ConnectorInfo, DeviceEvent,
            DriverCapability, KmsAllocator, KmsDevice, ObjectId, PropertyMap, PRIME_CAP_EXPORT,
            PRIME_CAP_IMPORT,
        },
    },
    video::{copy_frame, AllocationPool, AllocationQuery, VideoBuffer, VideoCaps, VideoInfo},
};

/// Names of the compositor properties
pub const COMPOSITOR_PROPERTIES: &[&str] = &[
    "driver-name",
    "bus-id",
    "connector-id",
    "connector-properties",
    "fd",
    "force-dma",
];

/// Lifecycle of a [`KmsCompositor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompositorState {
    /// No device is open
    Closed,
    /// The device is open, connector and planes are bound
    Ready,
    /// Output may be negotiated, frames may be composited
    Paused,
    /// Frames are composited
    Playing,
}

impl CompositorState {
    fn step_towards(self, target: CompositorState) -> CompositorState {
        use CompositorState::*;
        if target > self {
            match self {
                Closed => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            }
        } else if target < self {
            match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Closed => Closed,
            }
        } else {
            self
        }
    }
}

/// Output side state, valid between negotiation and the next reset
#[derive(Debug, Default)]
struct OutputState {
    info: Option<VideoInfo>,
    mode_blob: Option<u64>,
    need_modesetting: bool,
    src_needs_copy: bool,
    src_pool: Option<KmsBufferPool>,
    copy_pool: Option<SystemBufferPool>,
    // writeback buffer of the tick in progress
    src_buffer: Option<VideoBuffer>,
}

impl OutputState {
    fn release(self, device: &dyn KmsDevice) {
        if let Some(blob) = self.mode_blob {
            if let Err(err) = device.destroy_property_blob(blob) {
                warn!(blob, ?err, "Failed to destroy mode blob");
            }
        }
        if let Some(pool) = self.src_pool {
            if let Err(err) = pool.set_active(false) {
                warn!(?err, "Failed to deactivate writeback pool");
            }
        }
        if let Some(pool) = self.copy_pool {
            if let Err(err) = pool.set_active(false) {
                warn!(?err, "Failed to deactivate output pool");
            }
        }
    }
}

/// Everything bound while the device is open
#[derive(Debug)]
struct Session {
    device: Arc<dyn KmsDevice>,
    context: Arc<SharedContext>,
    connector: WritebackConnector,
    connector_info: ConnectorInfo,
    props: OutputProperties,
    allowed_caps: VideoCaps,
    pads: Vec<SinkPad>,
    has_async_page_flip: bool,
    output: OutputState,
}

impl Session {
    fn open(device: Arc<dyn KmsDevice>, settings: &CompositorSettings) -> Result<Session, Error> {
        let dev = &*device;
        match dev.driver() {
            Ok(driver) => info!(
                "Opened driver {} version {}.{}.{} ({})",
                driver.name, driver.version.0, driver.version.1, driver.version.2, driver.description
            ),
            Err(err) => warn!(?err, "Failed to query driver version"),
        }

        if dev.driver_capability(DriverCapability::DumbBuffer).unwrap_or(0) == 0 {
            return Err(Error::CapabilityMissing("dumb buffers"));
        }
        let prime = dev.driver_capability(DriverCapability::Prime).unwrap_or(0);
        let has_prime_import = prime & PRIME_CAP_IMPORT != 0;
        let has_prime_export = prime & PRIME_CAP_EXPORT != 0;
        let has_async_page_flip = dev
            .driver_capability(DriverCapability::AsyncPageFlip)
            .map_or(false, |cap| cap != 0);
        debug!(has_prime_import, has_prime_export, has_async_page_flip, "Device capabilities");

        for (cap, name) in [
            (ClientCapability::Atomic, "atomic modesetting"),
            (ClientCapability::UniversalPlanes, "universal planes"),
            (ClientCapability::WritebackConnectors, "writeback connectors"),
        ] {
            if let Err(err) = dev.set_client_capability(cap, true) {
                error!(?err, "Could not enable {}", name);
                return Err(Error::CapabilityMissing(name));
            }
        }

        let res = dev
            .resources()
            .access("Failed to query resources", dev)
            .map_err(Error::ResourceEnumerationFailed)?;
        let connector = select_connector(dev, &res, settings.connector_id)?;
        let connector_info = dev
            .connector(connector.id)
            .access("Failed to query connector", dev)
            .map_err(Error::ResourceEnumerationFailed)?;
        let planes = bind_planes(dev, &res, &connector, settings.max_planes)?;

        let connector_props = PropertyMap::read(dev, ObjectId::Connector(connector.id))
            .map_err(Error::ResourceEnumerationFailed)?;
        let crtc_props =
            PropertyMap::read(dev, ObjectId::Crtc(connector.crtc)).map_err(Error::ResourceEnumerationFailed)?;
        let props = OutputProperties {
            connector: connector.id,
            crtc: connector.crtc,
            mode_id: crtc_props.get("MODE_ID").map(|entry| entry.id),
            active: crtc_props.get("ACTIVE").map(|entry| entry.id),
            connector_props,
        };
        let allowed_caps = writeback_caps(dev, &props.connector_props, &connector_info, has_prime_export)?;

        let context = Arc::new(SharedContext {
            allocator: KmsAllocator::new(device.clone()),
            has_prime_import,
            has_prime_export,
        });
        let pads = planes
            .into_iter()
            .enumerate()
            .map(|(index, plane)| SinkPad::new(index, plane, context.clone()))
            .collect::<Vec<_>>();
        info!(
            connector = connector.id,
            crtc = connector.crtc,
            pads = pads.len(),
            "Compositor started"
        );

        Ok(Session {
            device,
            context,
            connector,
            connector_info,
            props,
            allowed_caps,
            pads,
            has_async_page_flip,
            output: OutputState::default(),
        })
    }

    fn reset_output(&mut self) {
        std::mem::take(&mut self.output).release(&*self.device);
        for pad in &self.pads {
            pad.reset();
        }
    }

    fn set_src_caps(&mut self, caps: &VideoCaps, force_dma: bool) -> Result<(), Error> {
        let info = VideoInfo::from_caps(caps)?;
        let mode = find_mode(&self.connector_info, info.width, info.height)
            .cloned()
            .ok_or(Error::ModeUnavailable {
                width: info.width,
                height: info.height,
            })?;

        let dev = &*self.device;
        if let Some(old) = self.output.mode_blob.take() {
            if let Err(err) = dev.destroy_property_blob(old) {
                warn!(blob = old, ?err, "Failed to destroy previous mode blob");
            }
        }
        let blob = dev
            .create_mode_blob(&mode)
            .access("Failed to create mode blob", dev)
            .map_err(Error::ModeBlobCreationFailed)?;
        debug!(%mode, blob, "Mode blob created");

        let output = &mut self.output;
        output.mode_blob = Some(blob);
        output.need_modesetting = true;
        output.src_needs_copy = !force_dma && !caps.has_dmabuf();
        output.info = Some(info);
        info!(%caps, src_needs_copy = output.src_needs_copy, "Output caps set");
        Ok(())
    }

    // (Re)configure the writeback pool and activate it
    fn activate_src_pool(&mut self, info: &VideoInfo, export: bool) -> Result<KmsBufferPool, PoolError> {
        let previous = self.output.src_pool.take();
        let reusable = previous.filter(|pool| {
            let matches = pool
                .config()
                .map_or(false, |config| config.has_option(PoolOptions::PRIME_EXPORT) == export);
            if !matches {
                if let Err(err) = pool.set_active(false) {
                    warn!(?err, "Failed to deactivate writeback pool");
                }
            }
            matches
        });

        let pool = match reusable {
            Some(pool) => {
                pool.set_active(false)?;
                let mut config = PoolConfig::new(*info, 2, 0);
                config.add_option(PoolOptions::VIDEO_META);
                if export {
                    config.add_option(PoolOptions::PRIME_EXPORT);
                }
                pool.set_config(config)?;
                pool
            }
            None => create_kms_pool(&self.context.allocator, info, info.size, 2, export)?,
        };
        pool.set_active(true)?;
        Ok(pool)
    }

    fn decide_allocation(&mut self, query: &mut AllocationQuery) -> Result<(), Error> {
        if self.output.info.is_none() {
            return Err(Error::NotNegotiated);
        }
        let info = VideoInfo::from_caps(query.caps())?;

        let export = self.context.has_prime_export && !self.output.src_needs_copy;
        let pool = match self.activate_src_pool(&info, export) {
            Ok(pool) => pool,
            Err(err) if export => {
                warn!(?err, "failed to activate prime export");
                self.output.src_needs_copy = true;
                self.activate_src_pool(&info, false)
                    .map_err(Error::OutputAllocationFailed)?
            }
            Err(err) => return Err(Error::OutputAllocationFailed(err)),
        };
        self.output.src_pool = Some(pool.clone());

        if self.output.src_needs_copy {
            let copy_pool = SystemBufferPool::new(SystemAllocator);
            let mut config = PoolConfig::new(info, 2, 0);
            config.add_option(PoolOptions::VIDEO_META);
            copy_pool.set_config(config).map_err(Error::OutputAllocationFailed)?;
            copy_pool.set_active(true).map_err(Error::OutputAllocationFailed)?;
            if let Some(old) = self.output.copy_pool.replace(copy_pool) {
                if let Err(err) = old.set_active(false) {
                    warn!(?err, "Failed to deactivate output pool");
                }
            }
            query.set_first_pool(AllocationPool {
                pool: None,
                size: info.size,
                min_buffers: 2,
                max_buffers: 0,
            });
        } else {
            query.set_first_pool(AllocationPool {
                pool: Some(pool),
                size: info.size,
                min_buffers: 2,
                max_buffers: 0,
            });
        }
        debug!(export, src_needs_copy = self.output.src_needs_copy, "Allocation decided");
        Ok(())
    }

    fn create_output_buffer(&mut self) -> Result<VideoBuffer, Error> {
        let output = &mut self.output;
        if output.src_buffer.is_some() {
            error!("Previous output not processed yet");
            return Err(Error::OutputPending);
        }
        let Some(pool) = &output.src_pool else {
            error!("No KMS pool configured");
            return Err(Error::NotNegotiated);
        };
        let src_buffer = pool.acquire().map_err(Error::OutputAllocationFailed)?;

        let outbuf = if output.src_needs_copy {
            let copy_pool = output.copy_pool.as_ref().ok_or(Error::NotNegotiated)?;
            copy_pool.acquire().map_err(Error::OutputAllocationFailed)?
        } else {
            src_buffer.clone()
        };
        output.src_buffer = Some(src_buffer);
        Ok(outbuf)
    }

    fn composite(
        &mut self,
        request: &mut AtomicRequest,
        settings: &CompositorSettings,
        outbuf: &VideoBuffer,
    ) -> Result<(), Error> {
        // released whatever the outcome
        let src_buffer = self.output.src_buffer.take().unwrap_or_else(|| outbuf.clone());
        if self.pads.is_empty() {
            error!("No input streams configured");
            return Err(Error::NoInputs);
        }
        let info = self.output.info.ok_or(Error::NotNegotiated)?;
        let writeback_fb = src_buffer
            .memory(0)
            .and_then(|mem| mem.as_kms())
            .map(|kms| kms.fb_id())
            .filter(|&fb| fb != 0)
            .ok_or(Error::FramebufferCreationFailed)?;

        let output_size = (info.width, info.height);
        let mut prepared = SmallVec::<[VideoBuffer; 4]>::new();
        let mut updates = SmallVec::<[(&PlaneBinding, PlaneUpdate); 4]>::new();
        for pad in &self.pads {
            let update = plane_update(pad, output_size, &mut prepared);
            updates.push((pad.plane(), update));
        }

        let mode_blob = if self.output.need_modesetting {
            self.output.mode_blob
        } else {
            None
        };
        let flags = fill_request(
            request,
            &self.props,
            writeback_fb,
            &settings.connector_properties,
            mode_blob,
            &updates,
        )?;
        drop(updates);

        let dev = &*self.device;
        trace!(?flags, objects = request.object_count(), "Committing");
        if let Err(err) = dev.atomic_commit(flags, request).access("Atomic commit failed", dev) {
            error!("Atomic modesetting failed: {}", err.source);
            if settings.debug_commits {
                error!("{:#?}", request);
            }
            return Err(Error::AtomicCommitFailed(err));
        }
        self.output.need_modesetting = false;

        let Some(fence) = request.take_out_fence() else {
            error!("Out sync file was not set properly");
            return Err(Error::FenceNotSet);
        };
        let signalled = poll_readable(fence.as_fd(), settings.fence_timeout)
            .access("Failed to poll writeback fence", dev)
            .map_err(Error::Event)?;
        drop(fence);
        if !signalled {
            error!("Timeout waiting for writeback fence");
            // keep the event queue bounded so the next tick can commit
            if let Err(err) = dev.receive_events(Duration::ZERO) {
                warn!(?err, "Failed to drain events");
            }
            return Err(Error::FenceTimeout(settings.fence_timeout));
        }
        wait_for_flip(dev, self.connector.crtc, settings.event_timeout)?;

        if self.output.src_needs_copy {
            copy_frame(&src_buffer, &info, outbuf, &info).map_err(Error::FrameCopyFailed)?;
        }
        trace!(inputs = prepared.len(), "Frame composited");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reset_output();
        self.context.allocator.clear_cache();
        debug!(connector = self.connector.id, "Session closed");
    }
}

// Decide what the plane of `pad` shows this tick, keeping prepared buffers alive in `prepared`
fn plane_update(pad: &SinkPad, output_size: (u32, u32), prepared: &mut SmallVec<[VideoBuffer; 4]>) -> PlaneUpdate {
    let (params, info, buffer) = pad.snapshot();
    let Some(buffer) = buffer else {
        trace!(pad = pad.index(), "No buffer, disabling plane");
        return PlaneUpdate::Disabled;
    };
    if params.kms_alpha() == 0 {
        trace!(pad = pad.index(), "Transparent, disabling plane");
        return PlaneUpdate::Disabled;
    }

    let kms_buffer = match pad.prepare_buffer(&buffer) {
        Ok(kms_buffer) => kms_buffer,
        Err(err) => {
            warn!(pad = pad.index(), ?err, "Failed to prepare buffer");
            return PlaneUpdate::Disabled;
        }
    };
    let Some(memory) = kms_buffer.memory(0).and_then(|mem| mem.as_kms()).filter(|kms| kms.fb_id() != 0) else {
        warn!(pad = pad.index(), "invalid buffer: it doesn't have a fb id");
        return PlaneUpdate::Disabled;
    };
    let frame = info.map_or_else(|| (memory.info().width, memory.info().height), |info| (info.width, info.height));

    let config = PlaneConfig::new(&params, memory.fb_id(), frame, kms_buffer.crop_meta(), output_size);
    match config {
        Some(config) => {
            prepared.push(kms_buffer);
            PlaneUpdate::Enabled(config)
        }
        None => PlaneUpdate::Disabled,
    }
}

/// Read events until the flip of `crtc` completed.
///
/// A flip reported for crtc 0 counts as ours. If only flips of other crtcs arrive before
/// `timeout` runs out, [`Error::UnexpectedFlipCrtc`] names the last of them.
fn wait_for_flip(device: &dyn KmsDevice, crtc: u32, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    let mut foreign = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let events = device
            .receive_events(remaining)
            .access("Failed to read events", device)
            .map_err(Error::Event)?;
        for event in events {
            match event {
                DeviceEvent::FlipComplete { crtc_id, sequence } if crtc_id == crtc || crtc_id == 0 => {
                    trace!(crtc_id, sequence, "Page flip complete");
                    return Ok(());
                }
                DeviceEvent::FlipComplete { crtc_id, .. } => {
                    warn!("Unexpected page flip for CRTC {}", crtc_id);
                    foreign = Some(crtc_id);
                }
                other => trace!(?other, "Ignoring event"),
            }
        }
        if remaining.is_zero() {
            break;
        }
    }

    match foreign {
        Some(crtc_id) => Err(Error::UnexpectedFlipCrtc(crtc_id)),
        None => {
            error!("Timeout waiting for page flip event");
            Err(Error::EventWaitTimeout(timeout))
        }
    }
}

#[cfg(feature = "backend_drm")]
fn fd_is_drm(fd: BorrowedFd<'_>) -> bool {
    crate::backend::drm::is_drm_device(fd)
}

#[cfg(not(feature = "backend_drm"))]
fn fd_is_drm(_fd: BorrowedFd<'_>) -> bool {
    false
}

/// A compositor blending its inputs with the planes of a writeback connector's crtc.
///
/// See the [module documentation](self) for an overview.
#[derive(Debug)]
pub struct KmsCompositor {
    settings: CompositorSettings,
    external_fd: Option<OwnedFd>,
    device: Option<Arc<dyn KmsDevice>>,
    state: CompositorState,
    flushing: bool,
    session: Option<Session>,
    request: AtomicRequest,
    span: tracing::Span,
}

impl KmsCompositor {
    /// Create a compositor opening its device on start according to `settings`
    pub fn new(mut settings: CompositorSettings) -> KmsCompositor {
        let fd = settings.fd.take();
        let mut compositor = KmsCompositor {
            settings,
            external_fd: None,
            device: None,
            state: CompositorState::Closed,
            flushing: true,
            session: None,
            request: AtomicRequest::new(),
            span: info_span!("kms_compositor"),
        };
        if let Some(fd) = fd {
            compositor.set_fd(fd);
        }
        compositor
    }

    /// Create a compositor driving an already opened `device`.
    ///
    /// Device selection settings are ignored.
    pub fn with_device(device: Arc<dyn KmsDevice>, settings: CompositorSettings) -> KmsCompositor {
        let mut compositor = KmsCompositor::new(settings);
        compositor.device = Some(device);
        compositor
    }

    /// Current settings
    pub fn settings(&self) -> &CompositorSettings {
        &self.settings
    }

    /// Current state
    pub fn state(&self) -> CompositorState {
        self.state
    }

    /// Sink pads, one per bound plane. Empty unless started.
    pub fn pads(&self) -> &[SinkPad] {
        self.session.as_ref().map_or(&[], |session| &session.pads[..])
    }

    /// Pad named `name`
    pub fn pad(&self, name: &str) -> Option<&SinkPad> {
        self.pads().iter().find(|pad| pad.name() == name)
    }

    /// The writeback connector in use
    pub fn connector_id(&self) -> Option<u32> {
        self.session.as_ref().map(|session| session.connector.id)
    }

    /// The crtc driving the writeback connector
    pub fn crtc_id(&self) -> Option<u32> {
        self.session.as_ref().map(|session| session.connector.crtc)
    }

    /// Whether the device supports asynchronous page flips
    pub fn has_async_page_flip(&self) -> bool {
        self.session.as_ref().map_or(false, |session| session.has_async_page_flip)
    }

    /// Negotiated output layout
    pub fn src_info(&self) -> Option<VideoInfo> {
        self.session.as_ref().and_then(|session| session.output.info)
    }

    /// Whether writeback frames are copied into plain memory for downstream
    pub fn src_needs_copy(&self) -> bool {
        self.session.as_ref().map_or(false, |session| session.output.src_needs_copy)
    }

    /// Blob holding the current output mode
    pub fn mode_blob(&self) -> Option<u64> {
        self.session.as_ref().and_then(|session| session.output.mode_blob)
    }

    /// Whether the next commit applies the output mode
    pub fn needs_modesetting(&self) -> bool {
        self.session.as_ref().map_or(false, |session| session.output.need_modesetting)
    }

    fn session(&self) -> Result<&Session, Error> {
        self.session.as_ref().ok_or(Error::NotNegotiated)
    }

    fn session_mut(&mut self) -> Result<&mut Session, Error> {
        self.session.as_mut().ok_or(Error::NotNegotiated)
    }

    fn set_fd(&mut self, fd: RawFd) {
        let _guard = self.span.enter();
        let exclusive = if self.settings.driver_name.is_some() {
            Some("driver-name")
        } else if self.settings.bus_id.is_some() {
            Some("bus-id")
        } else {
            None
        };
        if let Some(name) = exclusive {
            warn!("Can't set fd... {} already set.", name);
            return;
        }
        if self.settings.fd.is_some() {
            warn!("Can't set fd... it is already set.");
            return;
        }
        if fd < 0 {
            return;
        }

        // SAFETY: the caller passes an open descriptor it keeps owning, it is only
        // borrowed to be checked and duplicated.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if !fd_is_drm(borrowed) {
            warn!("Failed to verify fd is a DRM fd.");
            return;
        }
        match rustix::io::fcntl_dupfd_cloexec(borrowed, 0) {
            Ok(owned) => {
                debug!(fd, "Using external drm fd");
                self.external_fd = Some(owned);
                self.settings.fd = Some(fd);
            }
            Err(err) => warn!(fd, ?err, "Failed to duplicate fd"),
        }
    }

    fn set_device_name(&mut self, name: &'static str, value: Option<String>) {
        if value.is_some() && self.settings.fd.is_some() {
            let _guard = self.span.enter();
            warn!("Unsetting fd... {} has priority.", name);
            self.settings.fd = None;
            self.external_fd = None;
        }
        match name {
            "driver-name" => self.settings.driver_name = value,
            _ => self.settings.bus_id = value,
        }
    }

    /// Set a property by name.
    ///
    /// Device selection only takes effect on the next start.
    pub fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<(), PropertyError> {
        let name = COMPOSITOR_PROPERTIES
            .iter()
            .copied()
            .find(|n| *n == name)
            .ok_or_else(|| PropertyError::Unknown(name.to_owned()))?;
        match (name, value) {
            ("driver-name" | "bus-id", PropertyValue::String(value)) => self.set_device_name(name, value.clone()),
            ("connector-id", _) => {
                let id = value.as_i64().ok_or(PropertyError::InvalidType(name))?;
                if !(-1..=i64::from(i32::MAX)).contains(&id) {
                    return Err(PropertyError::OutOfRange(name));
                }
                self.settings.connector_id = u32::try_from(id).ok();
            }
            ("connector-properties", PropertyValue::Map(map)) => {
                self.settings.connector_properties = map.clone();
            }
            ("fd", _) => {
                let fd = value.as_i64().ok_or(PropertyError::InvalidType(name))?;
                let fd = RawFd::try_from(fd)
                    .ok()
                    .filter(|fd| *fd >= -1)
                    .ok_or(PropertyError::OutOfRange(name))?;
                self.set_fd(fd);
            }
            ("force-dma", _) => {
                self.settings.force_dma = value.as_bool().ok_or(PropertyError::InvalidType(name))?;
            }
            _ => return Err(PropertyError::InvalidType(name)),
        }
        Ok(())
    }

    /// Read a property by name
    pub fn property(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        let settings = &self.settings;
        Ok(match name {
            "driver-name" => PropertyValue::String(settings.driver_name.clone()),
            "bus-id" => PropertyValue::String(settings.bus_id.clone()),
            "connector-id" => PropertyValue::Int(settings.connector_id.map_or(-1, i64::from)),
            "connector-properties" => PropertyValue::Map(settings.connector_properties.clone()),
            "fd" => PropertyValue::Int(settings.fd.map_or(-1, i64::from)),
            "force-dma" => PropertyValue::Bool(settings.force_dma),
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        })
    }

    /// Replace the additional connector properties set on every commit
    pub fn set_connector_properties(&mut self, properties: IndexMap<String, u64>) {
        self.settings.connector_properties = properties;
    }

    #[cfg(feature = "backend_drm")]
    fn open_native(&self) -> Result<Arc<dyn KmsDevice>, Error> {
        use crate::backend::drm::{DrmDevice, DrmDeviceFd};

        let settings = &self.settings;
        let fd = if let Some(fd) = &self.external_fd {
            DrmDeviceFd::adopt(fd.as_fd()).map_err(|source| Error::DeviceOpen {
                driver: settings.fd.map(|fd| format!("fd {}", fd)),
                source,
            })?
        } else if settings.driver_name.is_some() || settings.bus_id.is_some() {
            DrmDeviceFd::open(settings.driver_name.as_deref(), settings.bus_id.as_deref()).map_err(|source| {
                Error::DeviceOpen {
                    driver: settings.driver_name.clone().or_else(|| settings.bus_id.clone()),
                    source,
                }
            })?
        } else {
            let (fd, driver) =
                DrmDeviceFd::probe().map_err(|source| Error::DeviceOpen { driver: None, source })?;
            info!(driver, "Probed drm driver");
            fd
        };
        Ok(Arc::new(DrmDevice::new(fd)))
    }

    #[cfg(not(feature = "backend_drm"))]
    fn open_native(&self) -> Result<Arc<dyn KmsDevice>, Error> {
        Err(Error::DeviceOpen {
            driver: self.settings.driver_name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Unsupported, "built without drm support"),
        })
    }

    fn start(&mut self) -> Result<(), Error> {
        let device = match &self.device {
            Some(device) => device.clone(),
            None => self.open_native()?,
        };
        self.session = Some(Session::open(device, &self.settings)?);
        Ok(())
    }

    fn change_state(&mut self, from: CompositorState, to: CompositorState) -> Result<(), Error> {
        use CompositorState::*;
        match (from, to) {
            (Closed, Ready) => self.start(),
            (Ready, Paused) => {
                self.flushing = false;
                Ok(())
            }
            (Paused, Playing) | (Playing, Paused) => Ok(()),
            (Paused, Ready) => {
                self.flushing = true;
                if let Some(session) = &mut self.session {
                    session.reset_output();
                }
                Ok(())
            }
            (Ready, Closed) => {
                self.session = None;
                Ok(())
            }
            (from, to) => Err(Error::InvalidState { from, to }),
        }
    }

    /// Move to `target`, passing through every state in between.
    ///
    /// A failed transition closes the device and leaves the compositor [`CompositorState::Closed`].
    pub fn set_state(&mut self, target: CompositorState) -> Result<(), Error> {
        let span = self.span.clone();
        let _guard = span.enter();
        while self.state != target {
            let from = self.state;
            let to = from.step_towards(target);
            if let Err(err) = self.change_state(from, to) {
                error!(?from, ?to, "State change failed: {}", err);
                self.session = None;
                self.state = CompositorState::Closed;
                self.flushing = true;
                return Err(err);
            }
            info!(?from, ?to, "State changed");
            self.state = to;
        }
        Ok(())
    }

    /// Caps the output can produce, restricted to `filter` if given.
    ///
    /// The order of the connector's caps is kept.
    pub fn src_caps(&self, filter: Option<&VideoCaps>) -> Result<VideoCaps, Error> {
        let allowed = &self.session()?.allowed_caps;
        Ok(match filter {
            Some(filter) => allowed.intersect(filter),
            None => allowed.clone(),
        })
    }

    /// Fixate `caps` to the fastest input framerate and the largest input's aspect ratio
    pub fn fixate_src_caps(&self, caps: &VideoCaps) -> Result<VideoCaps, Error> {
        let session = self.session()?;
        let infos = session.pads.iter().filter_map(SinkPad::info).collect::<SmallVec<[_; 4]>>();
        let mut dominant: Option<&VideoInfo> = None;
        for info in &infos {
            let area = u64::from(info.width) * u64::from(info.height);
            if dominant.map_or(true, |d| area > u64::from(d.width) * u64::from(d.height)) {
                dominant = Some(info);
            }
        }
        let fixed = fixate_src_caps(caps, infos.iter().map(|info| info.fps), dominant.map(|info| info.par));
        debug!(%fixed, "Fixated output caps");
        Ok(fixed)
    }

    /// Apply fixed output `caps`: install the matching mode and schedule a modeset
    pub fn set_src_caps(&mut self, caps: &VideoCaps) -> Result<(), Error> {
        let span = self.span.clone();
        let _guard = span.enter();
        let force_dma = self.settings.force_dma;
        self.session_mut()?.set_src_caps(caps, force_dma)
    }

    /// Negotiate the output against what `downstream` accepts, then apply the result
    pub fn negotiate(&mut self, downstream: Option<&VideoCaps>) -> Result<VideoCaps, Error> {
        let caps = self.src_caps(downstream)?;
        if caps.is_empty() {
            error!("No output caps in common with downstream");
            return Err(Error::NotNegotiated);
        }
        let fixed = self.fixate_src_caps(&caps)?;
        self.set_src_caps(&fixed)?;
        Ok(fixed)
    }

    /// Set up the writeback pool for the negotiated output and answer downstream's query.
    ///
    /// Downstream is handed the writeback pool when it accepts dma-bufs, otherwise it
    /// allocates plain memory and every frame is copied.
    pub fn decide_allocation(&mut self, query: &mut AllocationQuery) -> Result<(), Error> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.session_mut()?.decide_allocation(query)
    }

    /// Acquire the buffer the next frame is delivered in
    pub fn create_output_buffer(&mut self) -> Result<VideoBuffer, Error> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.session_mut()?.create_output_buffer()
    }

    /// Composite the current input frames into `outbuf` with one atomic commit
    #[instrument(level = "trace", skip_all)]
    #[profiling::function]
    pub fn aggregate_frames(&mut self, outbuf: &VideoBuffer) -> Result<(), Error> {
        let KmsCompositor {
            session,
            request,
            settings,
            span,
            ..
        } = self;
        let _guard = span.enter();
        let session = session.as_mut().ok_or(Error::NotNegotiated)?;
        session.composite(request, settings, outbuf)
    }

    /// Produce one composed frame
    pub fn aggregate(&mut self) -> Result<VideoBuffer, Error> {
        if self.flushing || self.state < CompositorState::Paused {
            return Err(Error::Flushing);
        }
        let outbuf = self.create_output_buffer()?;
        self.aggregate_frames(&outbuf)?;
        Ok(outbuf)
    }

    /// Stop compositing and drop the queued input frames
    pub fn flush_start(&mut self) {
        self.flushing = true;
        for pad in self.pads() {
            pad.clear_buffer();
        }
    }

    /// Resume compositing after [`flush_start`](KmsCompositor::flush_start)
    pub fn flush_stop(&mut self) {
        if self.state >= CompositorState::Paused {
            self.flushing = false;
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use std::os::unix::io::AsRawFd;

    use super::{CompositorSettings, CompositorState, KmsCompositor, PropertyError, PropertyValue};

    fn memfd() -> std::os::unix::io::OwnedFd {
        rustix::fs::memfd_create("not-drm", rustix::fs::MemfdFlags::CLOEXEC).unwrap()
    }

    #[test]
    fn state_steps() {
        use CompositorState::*;
        assert_eq!(Closed.step_towards(Playing), Ready);
        assert_eq!(Ready.step_towards(Playing), Paused);
        assert_eq!(Paused.step_towards(Playing), Playing);
        assert_eq!(Playing.step_towards(Closed), Paused);
        assert_eq!(Paused.step_towards(Closed), Ready);
        assert_eq!(Ready.step_towards(Closed), Closed);
    }

    #[test]
    fn property_roundtrip() {
        let mut compositor = KmsCompositor::new(CompositorSettings::default());
        assert_eq!(compositor.property("connector-id").unwrap(), PropertyValue::Int(-1));
        assert_eq!(compositor.property("fd").unwrap(), PropertyValue::Int(-1));

        compositor
            .set_property("driver-name", &PropertyValue::String(Some("vc4".into())))
            .unwrap();
        compositor.set_property("connector-id", &PropertyValue::Int(40)).unwrap();
        compositor.set_property("force-dma", &PropertyValue::Bool(true)).unwrap();
        let mut map = indexmap::IndexMap::new();
        map.insert("content-type".to_owned(), 2u64);
        compositor
            .set_property("connector-properties", &PropertyValue::Map(map.clone()))
            .unwrap();

        assert_eq!(
            compositor.property("driver-name").unwrap(),
            PropertyValue::String(Some("vc4".into()))
        );
        assert_eq!(compositor.property("connector-id").unwrap(), PropertyValue::Int(40));
        assert_eq!(compositor.property("force-dma").unwrap(), PropertyValue::Bool(true));
        assert_eq!(compositor.property("connector-properties").unwrap(), PropertyValue::Map(map));
        assert_eq!(compositor.settings().connector_id, Some(40));

        compositor.set_property("connector-id", &PropertyValue::Int(-1)).unwrap();
        assert_eq!(compositor.settings().connector_id, None);
    }

    #[test]
    fn invalid_property_writes() {
        let mut compositor = KmsCompositor::new(CompositorSettings::default());
        assert_eq!(
            compositor.set_property("connector-id", &PropertyValue::Int(-2)),
            Err(PropertyError::OutOfRange("connector-id"))
        );
        assert_eq!(
            compositor.set_property("force-dma", &PropertyValue::Int(1)),
            Err(PropertyError::InvalidType("force-dma"))
        );
        assert_eq!(
            compositor.set_property("bus-id", &PropertyValue::Int(1)),
            Err(PropertyError::InvalidType("bus-id"))
        );
        assert!(matches!(
            compositor.set_property("device", &PropertyValue::Int(1)),
            Err(PropertyError::Unknown(_))
        ));
        assert!(compositor.property("device").is_err());
    }

    #[test]
    fn non_drm_fd_is_rejected() {
        let fd = memfd();
        let mut compositor = KmsCompositor::new(CompositorSettings::default());
        compositor
            .set_property("fd", &PropertyValue::Int(fd.as_raw_fd().into()))
            .unwrap();
        assert_eq!(compositor.property("fd").unwrap(), PropertyValue::Int(-1));
        assert!(compositor.external_fd.is_none());

        let compositor = KmsCompositor::new(CompositorSettings {
            fd: Some(fd.as_raw_fd()),
            ..CompositorSettings::default()
        });
        assert_eq!(compositor.settings().fd, None);
    }

    #[test]
    fn fd_excluded_by_device_name() {
        let fd = memfd();
        let mut compositor = KmsCompositor::new(CompositorSettings {
            bus_id: Some("platform:vc4".into()),
            ..CompositorSettings::default()
        });
        compositor
            .set_property("fd", &PropertyValue::Int(fd.as_raw_fd().into()))
            .unwrap();
        assert_eq!(compositor.property("fd").unwrap(), PropertyValue::Int(-1));
    }

    #[test]
    fn device_name_unsets_fd() {
        let fd = memfd();
        let mut compositor = KmsCompositor::new(CompositorSettings::default());
        // pretend a verified fd was set
        compositor.external_fd = Some(rustix::io::fcntl_dupfd_cloexec(&fd, 0).unwrap());
        compositor.settings.fd = Some(fd.as_raw_fd());
        compositor
            .set_property("driver-name", &PropertyValue::String(Some("vc4".into())))
            .unwrap();
        assert_eq!(compositor.property("fd").unwrap(), PropertyValue::Int(-1));
        assert!(compositor.external_fd.is_none());
        // the caller's descriptor is untouched
        assert!(rustix::fs::fstat(&fd).is_ok());
    }

    #[test]
    fn calls_before_start() {
        let mut compositor = KmsCompositor::new(CompositorSettings::default());
        assert!(compositor.pads().is_empty());
        assert!(compositor.connector_id().is_none());
        assert!(matches!(compositor.src_caps(None), Err(super::Error::NotNegotiated)));
        assert!(matches!(compositor.aggregate(), Err(super::Error::Flushing)));
        assert!(matches!(
            compositor.create_output_buffer(),
            Err(super::Error::NotNegotiated)
        ));
    }
}
