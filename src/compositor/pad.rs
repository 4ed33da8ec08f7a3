//! Sink pads, one per bound plane.
//!
//! A [`SinkPad`] holds the caps, the current input buffer and the plane configuration
//! of one input. Upstream threads push buffers and change properties concurrently to the
//! aggregation, every access goes through the pad lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;
use tracing::{debug, debug_span, info, trace, warn};

use super::{
    error::{Error, PropertyError},
    plane::{BlendMode, PlaneBinding, Rotation},
    request::PlaneParams,
    settings::PropertyValue,
};
use crate::{
    backend::{
        allocator::{dmabuf::Dmabuf, KmsBufferPool, PoolConfig, PoolError, PoolOptions},
        drm::KmsAllocator,
    },
    video::{
        copy_frame, AllocationMeta, AllocationPool, AllocationQuery, VideoBuffer, VideoCaps, VideoInfo,
    },
};

/// Names of the pad properties
pub const PAD_PROPERTIES: &[&str] = &[
    "plane-id",
    "xpos",
    "ypos",
    "width",
    "height",
    "src-x",
    "src-y",
    "src-width",
    "src-height",
    "alpha",
    "blend",
    "rotation",
    "zorder",
    "primary",
    "zorder-mutable",
];

/// Device state shared by the compositor and its pads
#[derive(Debug)]
pub(crate) struct SharedContext {
    pub allocator: KmsAllocator,
    pub has_prime_import: bool,
    pub has_prime_export: bool,
}

/// Create an inactive pool of framebuffer memory for frames of `info`
pub(crate) fn create_kms_pool(
    allocator: &KmsAllocator,
    info: &VideoInfo,
    size: usize,
    min_buffers: u32,
    export: bool,
) -> Result<KmsBufferPool, PoolError> {
    let pool = KmsBufferPool::new(allocator.clone());
    let mut config = PoolConfig::new(*info, min_buffers, 0);
    config.size = size;
    config.add_option(PoolOptions::VIDEO_META);
    if export {
        config.add_option(PoolOptions::PRIME_EXPORT);
    }
    pool.set_config(config)?;
    Ok(pool)
}

#[derive(Debug)]
struct PadState {
    params: PlaneParams,
    info: Option<VideoInfo>,
    pool: Option<KmsBufferPool>,
    buffer: Option<VideoBuffer>,
}

#[derive(Debug)]
struct PadInner {
    index: usize,
    plane: PlaneBinding,
    context: Arc<SharedContext>,
    state: Mutex<PadState>,
    span: tracing::Span,
}

/// Input of the compositor, scanned out by one hardware plane
#[derive(Debug, Clone)]
pub struct SinkPad(Arc<PadInner>);

impl PartialEq for SinkPad {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn release_pool(pool: KmsBufferPool) {
    if let Err(err) = pool.set_active(false) {
        warn!(?err, "Failed to deactivate pad pool");
    }
}

fn int_in(value: &PropertyValue, name: &'static str, min: i64, max: i64) -> Result<i32, PropertyError> {
    let v = value.as_i64().ok_or(PropertyError::InvalidType(name))?;
    if v < min || v > max {
        return Err(PropertyError::OutOfRange(name));
    }
    Ok(v as i32)
}

impl SinkPad {
    pub(crate) fn new(index: usize, plane: PlaneBinding, context: Arc<SharedContext>) -> SinkPad {
        let params = PlaneParams {
            zorder: u32::try_from(plane.zpos).unwrap_or(u32::MAX),
            ..PlaneParams::default()
        };
        let span = debug_span!("sink_pad", index, plane = plane.id);
        SinkPad(Arc::new(PadInner {
            index,
            plane,
            context,
            state: Mutex::new(PadState {
                params,
                info: None,
                pool: None,
                buffer: None,
            }),
            span,
        }))
    }

    fn state(&self) -> MutexGuard<'_, PadState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Position of the pad in the compositor's pad list
    pub fn index(&self) -> usize {
        self.0.index
    }

    /// Name of the pad, `sink_<index>`
    pub fn name(&self) -> String {
        format!("sink_{}", self.0.index)
    }

    /// Id of the plane showing this input
    pub fn plane_id(&self) -> u32 {
        self.0.plane.id
    }

    /// Whether the plane is the primary plane of the crtc
    pub fn is_primary(&self) -> bool {
        self.0.plane.primary
    }

    /// Whether the z position can be changed
    pub fn zorder_mutable(&self) -> bool {
        self.0.plane.zpos_mutable
    }

    pub(crate) fn plane(&self) -> &PlaneBinding {
        &self.0.plane
    }

    /// Current plane configuration
    pub fn params(&self) -> PlaneParams {
        self.state().params
    }

    /// Destination position on the output
    pub fn set_position(&self, xpos: i32, ypos: i32) {
        let mut state = self.state();
        state.params.xpos = xpos;
        state.params.ypos = ypos;
    }

    /// Destination size on the output, -1 to use the output size
    pub fn set_size(&self, width: i32, height: i32) {
        let mut state = self.state();
        state.params.width = width.max(-1);
        state.params.height = height.max(-1);
    }

    /// Source rectangle in 16.16 fixed point, a size of -1 takes everything from the origin on
    pub fn set_source(&self, x: i32, y: i32, width: i32, height: i32) {
        let mut state = self.state();
        state.params.src_x = x.max(0);
        state.params.src_y = y.max(0);
        state.params.src_width = width.max(-1);
        state.params.src_height = height.max(-1);
    }

    /// Opacity between 0 and 1, a fully transparent pad disables its plane
    pub fn set_alpha(&self, alpha: f64) -> Result<(), PropertyError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(PropertyError::OutOfRange("alpha"));
        }
        self.state().params.alpha = alpha;
        Ok(())
    }

    /// Blend mode
    pub fn set_blend(&self, blend: BlendMode) {
        self.state().params.blend = blend;
    }

    /// Rotation and reflection
    pub fn set_rotation(&self, rotation: Rotation) {
        self.state().params.rotation = rotation;
    }

    /// Z position. Ignored if the plane has a fixed z position.
    pub fn set_zorder(&self, zorder: u32) {
        let _guard = self.0.span.enter();
        if !self.0.plane.zpos_mutable {
            warn!("zorder is not mutable for this plane");
            return;
        }
        self.state().params.zorder = zorder;
    }

    /// Set a property by name
    pub fn set_property(&self, name: &str, value: &PropertyValue) -> Result<(), PropertyError> {
        let _guard = self.0.span.enter();
        let name = PAD_PROPERTIES
            .iter()
            .copied()
            .find(|n| *n == name)
            .ok_or_else(|| PropertyError::Unknown(name.to_owned()))?;
        trace!(name, ?value, "set property");

        const MAX: i64 = i32::MAX as i64;
        let params = self.params();
        match name {
            "plane-id" | "primary" | "zorder-mutable" => return Err(PropertyError::ReadOnly(name)),
            "xpos" => self.set_position(int_in(value, name, i32::MIN.into(), MAX)?, params.ypos),
            "ypos" => self.set_position(params.xpos, int_in(value, name, i32::MIN.into(), MAX)?),
            "width" => self.set_size(int_in(value, name, -1, MAX)?, params.height),
            "height" => self.set_size(params.width, int_in(value, name, -1, MAX)?),
            "src-x" => self.set_source(
                int_in(value, name, 0, MAX)?,
                params.src_y,
                params.src_width,
                params.src_height,
            ),
            "src-y" => self.set_source(
                params.src_x,
                int_in(value, name, 0, MAX)?,
                params.src_width,
                params.src_height,
            ),
            "src-width" => self.set_source(
                params.src_x,
                params.src_y,
                int_in(value, name, -1, MAX)?,
                params.src_height,
            ),
            "src-height" => self.set_source(
                params.src_x,
                params.src_y,
                params.src_width,
                int_in(value, name, -1, MAX)?,
            ),
            "alpha" => match value {
                PropertyValue::Double(alpha) => self.set_alpha(*alpha)?,
                _ => return Err(PropertyError::InvalidType(name)),
            },
            "blend" => match value {
                PropertyValue::Blend(blend) => self.set_blend(*blend),
                PropertyValue::String(Some(nick)) => {
                    self.set_blend(nick.parse().map_err(|_| PropertyError::OutOfRange(name))?)
                }
                _ => return Err(PropertyError::InvalidType(name)),
            },
            "rotation" => match value {
                PropertyValue::Rotation(rotation) => self.set_rotation(*rotation),
                PropertyValue::UInt(_) | PropertyValue::Int(_) => {
                    let bits = value
                        .as_i64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or(PropertyError::OutOfRange(name))?;
                    self.set_rotation(Rotation::from_bits(bits).ok_or(PropertyError::OutOfRange(name))?)
                }
                _ => return Err(PropertyError::InvalidType(name)),
            },
            "zorder" => self.set_zorder(int_u32(value, name)?),
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        }
        Ok(())
    }

    /// Read a property by name
    pub fn property(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        let params = self.params();
        Ok(match name {
            "plane-id" => PropertyValue::Int(self.plane_id().into()),
            "xpos" => PropertyValue::Int(params.xpos.into()),
            "ypos" => PropertyValue::Int(params.ypos.into()),
            "width" => PropertyValue::Int(params.width.into()),
            "height" => PropertyValue::Int(params.height.into()),
            "src-x" => PropertyValue::Int(params.src_x.into()),
            "src-y" => PropertyValue::Int(params.src_y.into()),
            "src-width" => PropertyValue::Int(params.src_width.into()),
            "src-height" => PropertyValue::Int(params.src_height.into()),
            "alpha" => PropertyValue::Double(params.alpha),
            "blend" => PropertyValue::Blend(params.blend),
            "rotation" => PropertyValue::Rotation(params.rotation),
            "zorder" => PropertyValue::UInt(params.zorder.into()),
            "primary" => PropertyValue::Bool(self.is_primary()),
            "zorder-mutable" => PropertyValue::Bool(self.zorder_mutable()),
            _ => return Err(PropertyError::Unknown(name.to_owned())),
        })
    }

    /// Caps the plane accepts
    pub fn allowed_caps(&self) -> &VideoCaps {
        &self.0.plane.caps
    }

    /// Answer a caps query, optionally restricted by `filter`
    pub fn query_caps(&self, filter: Option<&VideoCaps>) -> VideoCaps {
        match filter {
            Some(filter) => self.0.plane.caps.intersect(filter),
            None => self.0.plane.caps.clone(),
        }
    }

    /// Whether buffers of `caps` can be accepted
    pub fn accept_caps(&self, caps: &VideoCaps) -> bool {
        self.0.plane.caps.can_intersect(caps)
    }

    /// Handle new input caps. The copy pool of the previous caps is dropped.
    pub fn set_caps(&self, caps: &VideoCaps) -> Result<(), Error> {
        let _guard = self.0.span.enter();
        let mut state = self.state();
        if let Some(pool) = state.pool.take() {
            release_pool(pool);
        }
        let info = VideoInfo::from_caps(caps)?;
        debug!(%caps, "Input caps set");
        state.info = Some(info);
        Ok(())
    }

    /// Negotiated input layout
    pub fn info(&self) -> Option<VideoInfo> {
        self.state().info
    }

    /// Queue `buffer` as the frame shown from the next aggregation on
    pub fn push_buffer(&self, buffer: VideoBuffer) {
        self.state().buffer = Some(buffer);
    }

    /// Drop the current frame, the plane is disabled until a new one is pushed
    pub fn clear_buffer(&self) {
        self.state().buffer = None;
    }

    /// The frame currently shown
    pub fn current_buffer(&self) -> Option<VideoBuffer> {
        self.state().buffer.clone()
    }

    // (params, info, buffer) taken under one lock
    pub(crate) fn snapshot(&self) -> (PlaneParams, Option<VideoInfo>, Option<VideoBuffer>) {
        let state = self.state();
        (state.params, state.info, state.buffer.clone())
    }

    pub(crate) fn reset(&self) {
        let mut state = self.state();
        state.buffer = None;
        state.info = None;
        if let Some(pool) = state.pool.take() {
            release_pool(pool);
        }
    }

    /// Turn `input` into a buffer backed by framebuffer memory.
    ///
    /// Framebuffer memory is passed through, dma-bufs are imported if the device supports it,
    /// everything else is copied into a buffer of the pad's own pool.
    #[profiling::function]
    pub fn prepare_buffer(&self, input: &VideoBuffer) -> Result<VideoBuffer, Error> {
        let _guard = self.0.span.enter();
        if input.memory(0).and_then(|mem| mem.as_kms()).is_some() {
            return Ok(input.clone());
        }
        let info = self.info().ok_or(Error::NotNegotiated)?;

        match self.import_dmabuf(input, &info) {
            Ok(Some(buffer)) => return Ok(buffer),
            Ok(None) => {}
            Err(err) => warn!(?err, "dma-buf import failed, copying instead"),
        }

        info!(target: "kms_compositor::performance", pad = self.0.index, "frame copy");
        self.copy_to_dumb_buffer(input, &info)
    }

    /// Wrap the dma-buf memories of `input` into framebuffer memory.
    ///
    /// Returns `None` if the buffer can not be imported as is: the device lacks PRIME import,
    /// the memories are not dma-bufs or a plane spans several memories.
    pub fn import_dmabuf(&self, input: &VideoBuffer, info: &VideoInfo) -> Result<Option<VideoBuffer>, Error> {
        let context = &self.0.context;
        if !context.has_prime_import || !input.memory(0).map_or(false, |mem| mem.is_dmabuf()) {
            return Ok(None);
        }

        let n_planes = info.n_planes();
        let n_mem = input.n_memory();
        trace!(n_planes, n_mem, "Found a dmabuf");
        if n_mem > n_planes {
            return Ok(None);
        }

        let mut layout = *info;
        if let Some(meta) = input.video_meta() {
            layout.width = meta.width;
            layout.height = meta.height;
            for i in 0..meta.n_planes() {
                layout.offsets[i] = meta.offsets[i];
                layout.strides[i] = meta.strides[i];
            }
        }

        let mut planes = SmallVec::<[&Dmabuf; 4]>::new();
        let mut skips = SmallVec::<[usize; 4]>::new();
        for plane in 0..n_planes {
            let Some((idx, skip)) = input.find_memory(layout.offsets[plane]) else {
                return Ok(None);
            };
            let Some(memory) = input.memory(idx) else {
                return Ok(None);
            };
            let Some(dmabuf) = memory.dmabuf() else {
                return Ok(None);
            };
            planes.push(dmabuf);
            skips.push(skip + memory.offset());
        }

        let first = input.memory(0).map_or(0, |mem| mem.offset());
        let allocator = &context.allocator;
        let memory = match allocator.cached(planes[0], first) {
            Some(memory) if same_layout(memory.info(), &layout) => {
                trace!(fb_id = memory.fb_id(), "found cached framebuffer");
                memory
            }
            _ => {
                let memory = allocator
                    .dmabuf_import(&planes, &skips, &layout)
                    .map_err(Error::ImportFailed)?;
                trace!(fb_id = memory.fb_id(), "caching imported framebuffer");
                allocator.cache_memory(planes[0], first, memory.clone());
                memory
            }
        };

        Ok(Some(
            VideoBuffer::builder()
                .memory(crate::video::Memory::Kms(memory))
                .metadata_from(input)
                .parent(input.clone())
                .build(),
        ))
    }

    fn copy_to_dumb_buffer(&self, input: &VideoBuffer, info: &VideoInfo) -> Result<VideoBuffer, Error> {
        let pool = {
            let mut state = self.state();
            match &state.pool {
                Some(pool) => pool.clone(),
                None => {
                    let mut layout = *info;
                    if let Some(meta) = input.video_meta() {
                        layout = VideoInfo::new(layout.format, meta.width, meta.height)
                            .with_fps(layout.fps)
                            .with_par(layout.par);
                    }
                    let pool = create_kms_pool(
                        &self.0.context.allocator,
                        &layout,
                        input.size(),
                        2,
                        false,
                    )
                    .map_err(Error::OutputAllocationFailed)?;
                    pool.set_active(true).map_err(Error::OutputAllocationFailed)?;
                    state.pool = Some(pool.clone());
                    pool
                }
            }
        };

        let pooled = pool.acquire().map_err(Error::OutputAllocationFailed)?;
        copy_frame(input, info, &pooled, info).map_err(Error::FrameCopyFailed)?;

        let memory = pooled.memory(0).cloned().ok_or(Error::FramebufferCreationFailed)?;
        let mut builder = VideoBuffer::builder().memory(memory).metadata_from(input);
        if let Some(meta) = pooled.video_meta() {
            builder = builder.video_meta(*meta);
        }
        Ok(builder.parent(pooled).build())
    }

    /// Offer upstream a pool of framebuffer memory and the metas the pad understands.
    ///
    /// Returns `false` if the query carries no valid caps.
    pub fn propose_allocation(&self, query: &mut AllocationQuery) -> bool {
        let _guard = self.0.span.enter();
        let info = match VideoInfo::from_caps(query.caps()) {
            Ok(info) => info,
            Err(err) => {
                debug!(?err, "Cannot propose allocation for caps");
                return false;
            }
        };

        let pool = if query.need_pool() {
            let context = &self.0.context;
            match create_kms_pool(&context.allocator, &info, info.size, 2, context.has_prime_export) {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(?err, "Failed to create pool");
                    return false;
                }
            }
        } else {
            None
        };
        query.add_pool(AllocationPool {
            pool,
            size: info.size,
            min_buffers: 2,
            max_buffers: 0,
        });
        query.add_meta(AllocationMeta::Video);
        query.add_meta(AllocationMeta::Crop);
        true
    }
}

fn int_u32(value: &PropertyValue, name: &'static str) -> Result<u32, PropertyError> {
    let v = value.as_i64().ok_or(PropertyError::InvalidType(name))?;
    u32::try_from(v).map_err(|_| PropertyError::OutOfRange(name))
}

/// Whether a framebuffer created for `a` scans out a frame laid out as `b`
fn same_layout(a: &VideoInfo, b: &VideoInfo) -> bool {
    a.format == b.format
        && a.width == b.width
        && a.height == b.height
        && a.strides == b.strides
        && a.offsets == b.offsets
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{SharedContext, SinkPad};
    use crate::{
        backend::{
            allocator::{dmabuf::Dmabuf, Fourcc},
            drm::{
                test::{DummyKmsDevice, DummyPlane, CRTC, FIRST_PLANE, WRITEBACK_CONNECTOR},
                KmsAllocator, KmsDevice,
            },
        },
        compositor::{
            connector::WritebackConnector,
            plane::{bind_planes, BlendMode, Rotation},
            settings::PropertyValue,
            Error, PropertyError,
        },
        video::{
            AllocationMeta, AllocationQuery, CropMeta, DmaBufMemory, Memory, SystemMemory, VideoBuffer,
            VideoFormat, VideoInfo, VideoMeta,
        },
    };

    fn pads(dev: &Arc<DummyKmsDevice>, import: bool) -> Vec<SinkPad> {
        let res = dev.resources().unwrap();
        let conn = WritebackConnector {
            id: WRITEBACK_CONNECTOR,
            crtc: CRTC,
            pipe: 0,
        };
        let context = Arc::new(SharedContext {
            allocator: KmsAllocator::new(dev.clone() as Arc<dyn KmsDevice>),
            has_prime_import: import,
            has_prime_export: true,
        });
        bind_planes(&**dev, &res, &conn, None)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, plane)| SinkPad::new(i, plane, context.clone()))
            .collect()
    }

    fn memfd_buffer(info: &VideoInfo, fill: u8) -> (Dmabuf, VideoBuffer) {
        let fd = rustix::fs::memfd_create("pad-test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, info.size as u64).unwrap();
        let dmabuf = Dmabuf::new(fd, info.size);
        dmabuf.map(info.size).unwrap().as_mut_slice().fill(fill);
        let buffer = VideoBuffer::builder()
            .memory(Memory::DmaBuf(DmaBufMemory::whole(dmabuf.clone())))
            .video_meta(VideoMeta::from_info(info))
            .build();
        (dmabuf, buffer)
    }

    #[test]
    fn properties_roundtrip() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[1];
        assert_eq!(pad.name(), "sink_1");
        pad.set_property("xpos", &PropertyValue::Int(-20)).unwrap();
        pad.set_property("src-width", &PropertyValue::Int(100 << 16)).unwrap();
        pad.set_property("alpha", &PropertyValue::Double(0.25)).unwrap();
        pad.set_property("blend", &PropertyValue::String(Some("pre".into())))
            .unwrap();
        pad.set_property("rotation", &PropertyValue::UInt(0b10010)).unwrap();
        pad.set_property("zorder", &PropertyValue::UInt(4)).unwrap();

        assert_eq!(pad.property("xpos").unwrap(), PropertyValue::Int(-20));
        assert_eq!(pad.property("src-width").unwrap(), PropertyValue::Int(100 << 16));
        assert_eq!(pad.property("src-height").unwrap(), PropertyValue::Int(-1));
        assert_eq!(pad.property("alpha").unwrap(), PropertyValue::Double(0.25));
        assert_eq!(
            pad.property("blend").unwrap(),
            PropertyValue::Blend(BlendMode::Premultiplied)
        );
        assert_eq!(
            pad.property("rotation").unwrap(),
            PropertyValue::Rotation(Rotation::ROTATE_90 | Rotation::REFLECT_X)
        );
        assert_eq!(pad.property("zorder").unwrap(), PropertyValue::UInt(4));
        assert_eq!(
            pad.property("plane-id").unwrap(),
            PropertyValue::Int(i64::from(FIRST_PLANE + 1))
        );
        assert_eq!(pad.property("primary").unwrap(), PropertyValue::Bool(false));
    }

    #[test]
    fn invalid_property_writes() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        assert_eq!(
            pad.set_property("primary", &PropertyValue::Bool(false)),
            Err(PropertyError::ReadOnly("primary"))
        );
        assert_eq!(
            pad.set_property("alpha", &PropertyValue::Double(1.5)),
            Err(PropertyError::OutOfRange("alpha"))
        );
        assert_eq!(
            pad.set_property("width", &PropertyValue::Int(-2)),
            Err(PropertyError::OutOfRange("width"))
        );
        assert_eq!(
            pad.set_property("xpos", &PropertyValue::Bool(true)),
            Err(PropertyError::InvalidType("xpos"))
        );
        assert_eq!(
            pad.set_property("rotation", &PropertyValue::UInt(0x100)),
            Err(PropertyError::OutOfRange("rotation"))
        );
        assert!(matches!(
            pad.set_property("volume", &PropertyValue::Int(1)),
            Err(PropertyError::Unknown(_))
        ));
        assert!(pad.property("volume").is_err());
    }

    #[test]
    fn fixed_zorder_ignores_writes() {
        let dev = DummyKmsDevice::builder()
            .planes(vec![DummyPlane::overlay(&[Fourcc::Xrgb8888], 5).fixed_zpos()])
            .build();
        let pad = &pads(&dev, true)[0];
        assert!(!pad.zorder_mutable());
        pad.set_property("zorder", &PropertyValue::UInt(1)).unwrap();
        assert_eq!(pad.property("zorder").unwrap(), PropertyValue::UInt(5));
    }

    #[test]
    fn caps_queries() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let nv12 = VideoInfo::new(VideoFormat::Nv12, 640, 480).to_caps();
        assert!(pad.accept_caps(&nv12));
        assert!(!pad.accept_caps(&VideoInfo::new(VideoFormat::I420, 640, 480).to_caps()));
        assert_eq!(pad.query_caps(Some(&nv12)).len(), 1);
        assert_eq!(&pad.query_caps(None), pad.allowed_caps());

        assert!(pad.info().is_none());
        pad.set_caps(&nv12).unwrap();
        assert_eq!(pad.info().unwrap().width, 640);
        assert!(matches!(
            pad.set_caps(&pad.allowed_caps().clone()),
            Err(Error::InvalidCaps(_))
        ));
    }

    #[test]
    fn kms_memory_passes_through() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let info = VideoInfo::new(VideoFormat::Bgrx, 64, 64);
        let memory = KmsAllocator::new(dev.clone() as Arc<dyn KmsDevice>)
            .alloc_dumb(&info, false)
            .unwrap();
        let input = VideoBuffer::from_memory(Memory::Kms(memory));
        // no caps needed for framebuffer memory
        assert!(pad.prepare_buffer(&input).unwrap().ptr_eq(&input));
    }

    #[test]
    fn dmabuf_import_is_cached() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let info = VideoInfo::new(VideoFormat::Nv12, 64, 48);
        pad.set_caps(&info.to_caps()).unwrap();
        let (_dmabuf, input) = memfd_buffer(&info, 0x40);

        let first = pad.prepare_buffer(&input).unwrap();
        let second = pad.prepare_buffer(&input).unwrap();
        let fb = first.memory(0).unwrap().as_kms().unwrap();
        assert_eq!(fb, second.memory(0).unwrap().as_kms().unwrap());
        assert!(first.parent().unwrap().ptr_eq(&input));
        let desc = dev.framebuffer(fb.fb_id()).unwrap();
        assert_eq!(desc.offsets[1], 64 * 48);
        assert_eq!(desc.fourcc, Fourcc::Nv12 as u32);
    }

    #[test]
    fn renegotiated_dmabuf_is_imported_again() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let large = VideoInfo::new(VideoFormat::Nv12, 64, 48);
        pad.set_caps(&large.to_caps()).unwrap();
        let (dmabuf, input) = memfd_buffer(&large, 0x40);
        let first = pad.prepare_buffer(&input).unwrap();
        let old_fb = first.memory(0).unwrap().as_kms().unwrap().fb_id();

        // same dma-buf, now carrying a smaller frame
        let small = VideoInfo::new(VideoFormat::Nv12, 32, 24);
        pad.set_caps(&small.to_caps()).unwrap();
        let input = VideoBuffer::builder()
            .memory(Memory::DmaBuf(DmaBufMemory::whole(dmabuf.clone())))
            .video_meta(VideoMeta::from_info(&small))
            .build();
        let second = pad.prepare_buffer(&input).unwrap();
        let fb = second.memory(0).unwrap().as_kms().unwrap();
        assert_ne!(fb.fb_id(), old_fb);
        let desc = dev.framebuffer(fb.fb_id()).unwrap();
        assert_eq!((desc.width, desc.height), (32, 24));
        assert_eq!(desc.offsets[1], 32 * 24);

        // and the new import is what the cache hands out from now on
        let third = pad.prepare_buffer(&input).unwrap();
        assert_eq!(third.memory(0).unwrap().as_kms().unwrap().fb_id(), fb.fb_id());
    }

    #[test]
    fn dmabuf_without_import_is_copied() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, false)[0];
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 8);
        pad.set_caps(&info.to_caps()).unwrap();
        let (_dmabuf, input) = memfd_buffer(&info, 0x11);

        let output = pad.prepare_buffer(&input).unwrap();
        let kms = output.memory(0).unwrap().as_kms().unwrap();
        assert!(kms.is_dumb());
        let map = output.map().unwrap();
        assert_eq!(map.range(0, 4), Some(&[0x11u8; 4][..]));
    }

    #[test]
    fn system_memory_is_copied_with_metadata() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let info = VideoInfo::new(VideoFormat::Bgrx, 16, 8);
        pad.set_caps(&info.to_caps()).unwrap();
        let input = VideoBuffer::builder()
            .memory(Memory::System(SystemMemory::from_vec(vec![0x22; info.size])))
            .crop_meta(CropMeta {
                x: 1,
                y: 1,
                width: 8,
                height: 4,
            })
            .build();

        let output = pad.prepare_buffer(&input).unwrap();
        assert!(output.memory(0).unwrap().as_kms().is_some());
        assert_eq!(output.crop_meta(), input.crop_meta());
        // the copy pool keeps two buffers around
        assert_eq!(dev.framebuffer_count(), 2);
        let again = pad.prepare_buffer(&input).unwrap();
        assert!(!again.ptr_eq(&output));

        pad.set_caps(&info.to_caps()).unwrap();
        drop((output, again));
        assert_eq!(dev.framebuffer_count(), 0);
    }

    #[test]
    fn uncopyable_input_fails() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let input = VideoBuffer::from_memory(Memory::System(SystemMemory::new(16)));
        assert!(matches!(pad.prepare_buffer(&input), Err(Error::NotNegotiated)));
        pad.set_caps(&VideoInfo::new(VideoFormat::Bgrx, 16, 8).to_caps())
            .unwrap();
        assert!(matches!(pad.prepare_buffer(&input), Err(Error::FrameCopyFailed(_))));
    }

    #[test]
    fn allocation_proposal() {
        let dev = DummyKmsDevice::new();
        let pad = &pads(&dev, true)[0];
        let info = VideoInfo::new(VideoFormat::Nv12, 64, 48);

        let mut query = AllocationQuery::new(info.to_caps(), true);
        assert!(pad.propose_allocation(&mut query));
        let proposal = &query.pools()[0];
        assert_eq!((proposal.size, proposal.min_buffers), (info.size, 2));
        let pool = proposal.pool.clone().unwrap();
        pool.set_active(true).unwrap();
        let buffer = pool.acquire().unwrap();
        assert!(buffer.memory(0).unwrap().as_kms().unwrap().dmabuf().is_some());
        assert!(query.has_meta(AllocationMeta::Video));
        assert!(query.has_meta(AllocationMeta::Crop));

        let mut without_pool = AllocationQuery::new(info.to_caps(), false);
        assert!(pad.propose_allocation(&mut without_pool));
        assert!(without_pool.pools()[0].pool.is_none());

        let mut invalid = AllocationQuery::new(pad.allowed_caps().clone(), true);
        assert!(!pad.propose_allocation(&mut invalid));
    }
}
