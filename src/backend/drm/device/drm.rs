use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, FromRawFd, OwnedFd},
    path::PathBuf,
    time::Duration,
};

use drm::{
    control::{self, connector, crtc, plane, property, Device as ControlDevice},
    Device as BasicDevice,
};
use tracing::{info_span, trace};

use super::{
    atomic::{AtomicCommitFlags, AtomicRequest},
    fd::DrmDeviceFd,
    poll_readable, ClientCapability, ConnectorInfo, CrtcInfo, DeviceEvent, DriverCapability, DriverInfo,
    DumbHandle, EncoderInfo, FramebufferDesc, KmsDevice, Mode, ObjectId, PlaneInfo, PropertyInfo, Resources,
};
use crate::utils::{DevPath, Mapping};

/// A KMS device backed by an open drm node
#[derive(Debug)]
pub struct DrmDevice {
    fd: DrmDeviceFd,
    span: tracing::Span,
}

fn handle<T: From<control::RawResourceHandle>>(id: u32) -> io::Result<T> {
    control::from_u32(id).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null object id"))
}

impl DrmDevice {
    /// Wrap an open drm node
    pub fn new(fd: DrmDeviceFd) -> DrmDevice {
        let span = info_span!("drm_device", path = ?fd.dev_path());
        DrmDevice { fd, span }
    }

    /// The underlying file descriptor
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }
}

impl From<control::Mode> for Mode {
    fn from(mode: control::Mode) -> Mode {
        let raw: drm_ffi::drm_mode_modeinfo = mode.into();
        let name: Vec<u8> = raw
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Mode {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            vrefresh: raw.vrefresh,
            flags: raw.flags,
            mode_type: raw.type_,
            name: String::from_utf8_lossy(&name).into_owned(),
        }
    }
}

impl From<&Mode> for drm_ffi::drm_mode_modeinfo {
    fn from(mode: &Mode) -> Self {
        let mut name = [0 as std::ffi::c_char; 32];
        for (dst, src) in name.iter_mut().zip(mode.c_name().as_bytes()) {
            *dst = *src as std::ffi::c_char;
        }
        drm_ffi::drm_mode_modeinfo {
            clock: mode.clock,
            hdisplay: mode.hdisplay,
            hsync_start: mode.hsync_start,
            hsync_end: mode.hsync_end,
            htotal: mode.htotal,
            hskew: mode.hskew,
            vdisplay: mode.vdisplay,
            vsync_start: mode.vsync_start,
            vsync_end: mode.vsync_end,
            vtotal: mode.vtotal,
            vscan: mode.vscan,
            vrefresh: mode.vrefresh,
            flags: mode.flags,
            type_: mode.mode_type,
            name,
        }
    }
}

fn range_bounds(range: impl std::ops::RangeBounds<u32>) -> (u32, u32) {
    use std::ops::Bound;

    let min = match range.start_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let max = match range.end_bound() {
        Bound::Included(&v) => v,
        Bound::Excluded(&v) => v.saturating_sub(1),
        Bound::Unbounded => u32::MAX,
    };
    (min, max)
}

const EVENT_HEADER_LEN: usize = 8;

/// Split a buffer read from a drm fd into events
///
/// `ControlDevice::receive_events` from drm-rs is not used here: it turns the crtc id into a
/// `crtc::Handle` and panics on 0, which older kernels report in `FLIP_COMPLETE` events of
/// atomic commits. Such flips are ours, so the raw id is kept.
pub(crate) fn parse_events(buf: &[u8]) -> Vec<DeviceEvent> {
    let word = |at: usize| -> Option<u32> {
        buf.get(at..at + 4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    };

    let mut events = Vec::new();
    let mut offset = 0;
    while offset + EVENT_HEADER_LEN <= buf.len() {
        let (Some(kind), Some(length)) = (word(offset), word(offset + 4)) else {
            break;
        };
        let length = length as usize;
        if length < EVENT_HEADER_LEN || offset + length > buf.len() {
            break;
        }
        // drm_event_vblank: header, user_data, tv_sec, tv_usec, sequence, crtc_id
        let vblank = || Some((word(offset + 28)?, word(offset + 24)?));
        let event = match kind {
            drm_ffi::DRM_EVENT_FLIP_COMPLETE if length >= 32 => vblank()
                .map(|(crtc_id, sequence)| DeviceEvent::FlipComplete { crtc_id, sequence }),
            drm_ffi::DRM_EVENT_VBLANK if length >= 32 => {
                vblank().map(|(crtc_id, sequence)| DeviceEvent::Vblank { crtc_id, sequence })
            }
            other => Some(DeviceEvent::Other(other)),
        };
        events.extend(event);
        offset += length;
    }
    events
}

impl KmsDevice for DrmDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        self.fd.dev_path()
    }

    fn driver(&self) -> io::Result<DriverInfo> {
        let mut name = Vec::new();
        let mut desc = Vec::new();
        let version = drm_ffi::get_version(self.fd.as_fd(), Some(&mut name), None, Some(&mut desc))?;
        let to_string = |v: Vec<i8>| String::from_utf8_lossy(&v.into_iter().map(|c| c as u8).collect::<Vec<_>>()).into_owned();
        Ok(DriverInfo {
            name: to_string(name),
            version: (
                version.version_major,
                version.version_minor,
                version.version_patchlevel,
            ),
            description: to_string(desc),
        })
    }

    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64> {
        let cap = match cap {
            DriverCapability::DumbBuffer => drm::DriverCapability::DumbBuffer,
            DriverCapability::Prime => drm::DriverCapability::Prime,
            DriverCapability::AsyncPageFlip => drm::DriverCapability::ASyncPageFlip,
        };
        self.fd.get_driver_capability(cap)
    }

    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        let cap = match cap {
            ClientCapability::UniversalPlanes => drm_ffi::DRM_CLIENT_CAP_UNIVERSAL_PLANES,
            ClientCapability::Atomic => drm_ffi::DRM_CLIENT_CAP_ATOMIC,
            // not covered by drm::ClientCapability
            ClientCapability::WritebackConnectors => drm_ffi::DRM_CLIENT_CAP_WRITEBACK_CONNECTORS,
        };
        drm_ffi::set_capability(self.fd.as_fd(), cap as u64, enable)?;
        Ok(())
    }

    fn resources(&self) -> io::Result<Resources> {
        let res = self.fd.resource_handles()?;
        let (min_width, max_width) = range_bounds(res.supported_fb_width());
        let (min_height, max_height) = range_bounds(res.supported_fb_height());
        Ok(Resources {
            connectors: res.connectors().iter().map(|&h| u32::from(h)).collect(),
            crtcs: res.crtcs().iter().map(|&h| u32::from(h)).collect(),
            min_width,
            max_width,
            min_height,
            max_height,
        })
    }

    fn plane_handles(&self) -> io::Result<Vec<u32>> {
        Ok(self
            .fd
            .plane_handles()?
            .into_iter()
            .map(u32::from)
            .collect())
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let info = self.fd.get_connector(handle::<connector::Handle>(id)?, false)?;
        Ok(ConnectorInfo {
            id,
            connector_type: u32::from(info.interface()),
            current_encoder: info.current_encoder().map(u32::from),
            encoders: info.encoders().iter().map(|&h| u32::from(h)).collect(),
            modes: info.modes().iter().map(|&m| Mode::from(m)).collect(),
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        // possible_crtcs is only exposed as an opaque filter by drm-rs
        let info = drm_ffi::mode::get_encoder(self.fd.as_fd(), id)?;
        Ok(EncoderInfo {
            id,
            crtc: (info.crtc_id != 0).then_some(info.crtc_id),
            possible_crtcs: info.possible_crtcs,
        })
    }

    fn crtc(&self, id: u32) -> io::Result<CrtcInfo> {
        let info = self.fd.get_crtc(handle::<crtc::Handle>(id)?)?;
        Ok(CrtcInfo {
            id,
            framebuffer: info.framebuffer().map(u32::from),
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let mut formats = Vec::new();
        let info = drm_ffi::mode::get_plane(self.fd.as_fd(), id, Some(&mut formats))?;
        Ok(PlaneInfo {
            id,
            possible_crtcs: info.possible_crtcs,
            formats,
        })
    }

    fn properties(&self, object: ObjectId) -> io::Result<Vec<(u32, u64)>> {
        let set = match object {
            ObjectId::Connector(id) => self.fd.get_properties(handle::<connector::Handle>(id)?)?,
            ObjectId::Crtc(id) => self.fd.get_properties(handle::<crtc::Handle>(id)?)?,
            ObjectId::Plane(id) => self.fd.get_properties(handle::<plane::Handle>(id)?)?,
        };
        Ok(set
            .into_iter()
            .map(|(prop, value)| (u32::from(prop), value))
            .collect())
    }

    fn property(&self, id: u32) -> io::Result<PropertyInfo> {
        let info = self.fd.get_property(handle::<property::Handle>(id)?)?;
        Ok(PropertyInfo {
            id,
            name: info.name().to_string_lossy().into_owned(),
            immutable: !info.mutable(),
        })
    }

    fn property_blob(&self, blob_id: u64) -> io::Result<Vec<u8>> {
        self.fd.get_property_blob(blob_id)
    }

    fn create_mode_blob(&self, mode: &Mode) -> io::Result<u64> {
        let _guard = self.span.enter();
        let raw = drm_ffi::drm_mode_modeinfo::from(mode);
        match self.fd.create_property_blob(&raw)? {
            property::Value::Blob(id) => {
                trace!(id, %mode, "created mode blob");
                Ok(id)
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "driver did not return a blob")),
        }
    }

    fn destroy_property_blob(&self, blob_id: u64) -> io::Result<()> {
        self.fd.destroy_property_blob(blob_id)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbHandle> {
        let info = drm_ffi::mode::dumbbuffer::create(self.fd.as_fd(), width, height, bpp, 0)?;
        Ok(DumbHandle {
            handle: info.handle,
            pitch: info.pitch,
            size: info.size,
        })
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.fd.as_fd(), handle)?;
        Ok(())
    }

    fn map_dumb(&self, handle: u32, len: usize) -> io::Result<Mapping> {
        let info = drm_ffi::mode::dumbbuffer::map(self.fd.as_fd(), handle, 0, 0)?;
        Mapping::new(self.fd.as_fd(), info.offset, len)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<u32> {
        let fb = drm_ffi::mode::add_fb2(
            self.fd.as_fd(),
            desc.width,
            desc.height,
            desc.fourcc,
            &desc.handles,
            &desc.pitches,
            &desc.offsets,
            &[0; 4],
            0,
        )?;
        Ok(fb.fb_id)
    }

    fn destroy_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        drm_ffi::mode::rm_fb(self.fd.as_fd(), fb_id)
    }

    fn prime_import(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        Ok(drm_ffi::gem::fd_to_handle(self.fd.as_fd(), fd)?.handle)
    }

    fn prime_export(&self, handle: u32) -> io::Result<OwnedFd> {
        let flags = (rustix::fs::OFlags::CLOEXEC | rustix::fs::OFlags::RDWR).bits();
        let prime = drm_ffi::gem::handle_to_fd(self.fd.as_fd(), handle, flags)?;
        // SAFETY: the kernel hands us a fresh descriptor we now own
        Ok(unsafe { OwnedFd::from_raw_fd(prime.fd) })
    }

    fn close_handle(&self, handle: u32) -> io::Result<()> {
        drm_ffi::gem::close(self.fd.as_fd(), handle)?;
        Ok(())
    }

    #[profiling::function]
    fn atomic_commit(&self, flags: AtomicCommitFlags, request: &mut AtomicRequest) -> io::Result<()> {
        let (objects, counts, props, values) = request.raw_arrays();
        drm_ffi::mode::atomic_commit(self.fd.as_fd(), flags.bits(), objects, counts, props, values)
    }

    fn receive_events(&self, timeout: Duration) -> io::Result<Vec<DeviceEvent>> {
        if !poll_readable(self.fd.as_fd(), timeout)? {
            return Ok(Vec::new());
        }
        let mut buf = [0u8; 1024];
        let len = rustix::io::retry_on_intr(|| rustix::io::read(self.fd.as_fd(), &mut buf))?;
        Ok(parse_events(&buf[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_events, DeviceEvent};

    fn vblank_event(kind: u32, sequence: u32, crtc_id: u32) -> Vec<u8> {
        let mut ev = Vec::new();
        ev.extend_from_slice(&kind.to_ne_bytes());
        ev.extend_from_slice(&32u32.to_ne_bytes());
        ev.extend_from_slice(&0u64.to_ne_bytes());
        ev.extend_from_slice(&0u32.to_ne_bytes());
        ev.extend_from_slice(&0u32.to_ne_bytes());
        ev.extend_from_slice(&sequence.to_ne_bytes());
        ev.extend_from_slice(&crtc_id.to_ne_bytes());
        ev
    }

    #[test]
    fn parses_multiple_events() {
        let mut buf = vblank_event(drm_ffi::DRM_EVENT_VBLANK, 7, 31);
        buf.extend(vblank_event(drm_ffi::DRM_EVENT_FLIP_COMPLETE, 8, 0));
        assert_eq!(
            parse_events(&buf),
            vec![
                DeviceEvent::Vblank {
                    crtc_id: 31,
                    sequence: 7
                },
                DeviceEvent::FlipComplete {
                    crtc_id: 0,
                    sequence: 8
                },
            ]
        );
    }

    #[test]
    fn flip_without_crtc_id_is_reported() {
        let mut buf = vblank_event(drm_ffi::DRM_EVENT_FLIP_COMPLETE, 3, 0);
        buf.extend_from_slice(&0x8000_0001u32.to_ne_bytes());
        buf.extend_from_slice(&12u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        assert_eq!(
            parse_events(&buf),
            vec![
                DeviceEvent::FlipComplete {
                    crtc_id: 0,
                    sequence: 3
                },
                DeviceEvent::Other(0x8000_0001),
            ]
        );
    }

    #[test]
    fn truncated_event_is_dropped() {
        let buf = vblank_event(drm_ffi::DRM_EVENT_FLIP_COMPLETE, 1, 31);
        assert!(parse_events(&buf[..20]).is_empty());
    }
}
