//! Binding of hardware planes to sink pads.

use std::{fmt, str::FromStr};

use tracing::{debug, trace, warn};

use super::{caps::plane_sink_caps, connector::WritebackConnector, Error};
use crate::{
    backend::drm::{
        error::AccessContext, KmsDevice, ObjectId, PropertyMap, Resources, PLANE_TYPE_OVERLAY,
        PLANE_TYPE_PRIMARY,
    },
    video::VideoCaps,
};

/// Plane properties set on every commit, in request order
pub const PLANE_PROPERTIES: [&str; 14] = [
    "FB_ID",
    "CRTC_ID",
    "CRTC_X",
    "CRTC_Y",
    "CRTC_W",
    "CRTC_H",
    "SRC_X",
    "SRC_Y",
    "SRC_W",
    "SRC_H",
    "alpha",
    "pixel blend mode",
    "rotation",
    "zpos",
];

pub(crate) const FB_ID: usize = 0;
pub(crate) const CRTC_ID: usize = 1;
pub(crate) const ZPOS: usize = 13;

/// How a plane is blended onto the planes below it
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Pixel alpha is ignored
    None = 0,
    /// Colors are premultiplied with the pixel alpha
    Premultiplied = 1,
    /// Pixel alpha is applied on blending
    #[default]
    Coverage = 2,
}

impl BlendMode {
    /// Short name of the mode
    pub fn nick(self) -> &'static str {
        match self {
            BlendMode::None => "none",
            BlendMode::Premultiplied => "pre",
            BlendMode::Coverage => "cov",
        }
    }
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

/// Unknown blend mode name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown blend mode `{0}`")]
pub struct UnknownBlendMode(pub String);

impl FromStr for BlendMode {
    type Err = UnknownBlendMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BlendMode::None),
            "pre" => Ok(BlendMode::Premultiplied),
            "cov" => Ok(BlendMode::Coverage),
            _ => Err(UnknownBlendMode(s.to_owned())),
        }
    }
}

bitflags::bitflags! {
    /// Value of the `rotation` plane property
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rotation: u32 {
        /// No rotation
        const ROTATE_0      =   0b00000001;
        /// Rotate by 90 degrees
        const ROTATE_90     =   0b00000010;
        /// Rotate by 180 degrees
        const ROTATE_180    =   0b00000100;
        /// Rotate by 270 degrees
        const ROTATE_270    =   0b00001000;
        /// Mirror horizontally
        const REFLECT_X     =   0b00010000;
        /// Mirror vertically
        const REFLECT_Y     =   0b00100000;
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::ROTATE_0
    }
}

/// A plane usable as compositor input
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneBinding {
    /// Plane id
    pub id: u32,
    /// Whether the plane is the crtc's primary plane
    pub primary: bool,
    /// Ids of [`PLANE_PROPERTIES`], same order
    pub prop_ids: [u32; 14],
    /// Current z position
    pub zpos: u64,
    /// Whether `zpos` can be changed
    pub zpos_mutable: bool,
    /// Frames the plane can scan out
    pub caps: VideoCaps,
}

impl PlaneBinding {
    /// Inspect `plane`, returns `None` if it can not be used
    fn new(device: &dyn KmsDevice, res: &Resources, plane: u32, pipe: u32) -> Option<PlaneBinding> {
        let info = device.plane(plane).ok()?;
        if info.possible_crtcs & (1 << pipe) == 0 {
            trace!(plane, "Plane does not belong to our crtc");
            return None;
        }

        let props = match PropertyMap::read(device, ObjectId::Plane(plane)) {
            Ok(props) => props,
            Err(err) => {
                warn!(plane, ?err, "Failed to read plane properties");
                return None;
            }
        };
        let Some(plane_type) = props.get("type").map(|p| p.value) else {
            warn!("Plane {} is missing property type, ignored", plane);
            return None;
        };
        if plane_type != PLANE_TYPE_OVERLAY && plane_type != PLANE_TYPE_PRIMARY {
            trace!(plane, plane_type, "Ignoring plane type");
            return None;
        }

        let mut prop_ids = [0u32; 14];
        for (slot, name) in prop_ids.iter_mut().zip(PLANE_PROPERTIES) {
            match props.get(name) {
                Some(entry) => *slot = entry.id,
                None => {
                    warn!(plane, missing = name, "Not all plane properties were returned by the driver");
                    return None;
                }
            }
        }
        let (zpos, zpos_mutable) = props
            .get("zpos")
            .map(|entry| (entry.value, !entry.immutable))
            .unwrap_or((0, true));

        let caps = plane_sink_caps(&info.formats, res);
        if caps.is_empty() {
            debug!(plane, "Plane supports no known format");
            return None;
        }

        Some(PlaneBinding {
            id: plane,
            primary: plane_type == PLANE_TYPE_PRIMARY,
            prop_ids,
            zpos,
            zpos_mutable,
            caps,
        })
    }
}

/// Collect the planes of `connector`'s crtc that can be bound to sink pads.
///
/// At most `max_planes` are returned if set. Fails if no plane is usable.
pub fn bind_planes(
    device: &dyn KmsDevice,
    res: &Resources,
    connector: &WritebackConnector,
    max_planes: Option<usize>,
) -> Result<Vec<PlaneBinding>, Error> {
    let handles = device
        .plane_handles()
        .access("Failed to list planes", device)
        .map_err(Error::ResourceEnumerationFailed)?;

    let limit = max_planes.unwrap_or(usize::MAX);
    let bound = handles
        .into_iter()
        .filter_map(|plane| PlaneBinding::new(device, res, plane, connector.pipe))
        .take(limit)
        .collect::<Vec<_>>();
    for plane in &bound {
        debug!(
            plane = plane.id,
            primary = plane.primary,
            zpos = plane.zpos,
            zpos_mutable = plane.zpos_mutable,
            caps = %plane.caps,
            "Bound plane"
        );
    }

    if bound.is_empty() {
        return Err(Error::NoAcceptablePlane(connector.crtc));
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::{bind_planes, BlendMode, Rotation, PLANE_PROPERTIES};
    use crate::{
        backend::{
            allocator::Fourcc,
            drm::{
                test::{DummyKmsDevice, DummyPlane, CRTC, FIRST_PLANE, WRITEBACK_CONNECTOR},
                KmsDevice,
            },
        },
        compositor::{connector::WritebackConnector, Error},
        video::VideoFormat,
    };

    fn connector() -> WritebackConnector {
        WritebackConnector {
            id: WRITEBACK_CONNECTOR,
            crtc: CRTC,
            pipe: 0,
        }
    }

    #[test]
    fn binds_primary_and_overlay_only() {
        let dev = DummyKmsDevice::new();
        let res = dev.resources().unwrap();
        let planes = bind_planes(&*dev, &res, &connector(), None).unwrap();
        // the cursor and the plane of the other crtc are skipped
        assert_eq!(
            planes.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![FIRST_PLANE, FIRST_PLANE + 1]
        );
        assert!(planes[0].primary);
        assert!(!planes[1].primary);
        assert_eq!(planes[1].zpos, 1);
        assert!(planes[1].zpos_mutable);
        for (id, name) in planes[0].prop_ids.iter().zip(PLANE_PROPERTIES) {
            assert_eq!(Some(*id), dev.property_id(FIRST_PLANE, name));
        }
        let formats = &planes[0].caps.structure(0).unwrap().formats;
        assert!(formats.contains(&VideoFormat::Nv12));
        assert!(formats.contains(&VideoFormat::Bgrx));
    }

    #[test]
    fn incomplete_planes_are_rejected() {
        let dev = DummyKmsDevice::builder()
            .planes(vec![
                DummyPlane::primary(&[Fourcc::Xrgb8888]).without("pixel blend mode"),
                DummyPlane::overlay(&[Fourcc::Xrgb8888], 2).without("type"),
                DummyPlane::overlay(&[Fourcc::Xrgb8888], 3).fixed_zpos(),
            ])
            .build();
        let res = dev.resources().unwrap();
        let planes = bind_planes(&*dev, &res, &connector(), None).unwrap();
        assert_eq!(planes.len(), 1);
        assert_eq!(planes[0].id, FIRST_PLANE + 2);
        assert!(!planes[0].zpos_mutable);
        assert_eq!(planes[0].zpos, 3);
    }

    #[test]
    fn plane_limit() {
        let dev = DummyKmsDevice::new();
        let res = dev.resources().unwrap();
        assert_eq!(bind_planes(&*dev, &res, &connector(), Some(1)).unwrap().len(), 1);
        assert!(matches!(
            bind_planes(&*dev, &res, &connector(), Some(0)),
            Err(Error::NoAcceptablePlane(CRTC))
        ));
    }

    #[test]
    fn planes_without_known_formats_are_rejected() {
        let dev = DummyKmsDevice::builder()
            .planes(vec![DummyPlane::primary(&[Fourcc::C8])])
            .build();
        let res = dev.resources().unwrap();
        assert!(matches!(
            bind_planes(&*dev, &res, &connector(), None),
            Err(Error::NoAcceptablePlane(CRTC))
        ));
    }

    #[test]
    fn blend_names() {
        assert_eq!("pre".parse::<BlendMode>().unwrap(), BlendMode::Premultiplied);
        assert_eq!(BlendMode::default().nick(), "cov");
        assert!("add".parse::<BlendMode>().is_err());
        assert_eq!(Rotation::default().bits(), 1);
    }
}
