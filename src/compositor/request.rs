//! Assembly of the per-frame atomic request.
//!
//! A frame commit is made of three parts:
//! - the writeback connector, pointed at the output framebuffer and the out-fence slot,
//! - the crtc, only while a new mode has to be applied,
//! - one block per bound plane, either its full configuration or `FB_ID = 0, CRTC_ID = 0`.
//!
//! Everything here is pure bookkeeping on an [`AtomicRequest`], the device is not touched.

use indexmap::IndexMap;
use tracing::{trace, warn};

use super::{
    plane::{BlendMode, PlaneBinding, Rotation, CRTC_ID, FB_ID, ZPOS},
    Error,
};
use crate::{
    backend::drm::{AtomicCommitFlags, AtomicRequest, PropertyMap},
    video::CropMeta,
};

/// User-facing geometry and blending of a sink pad
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneParams {
    /// Horizontal position on the output
    pub xpos: i32,
    /// Vertical position on the output
    pub ypos: i32,
    /// Width on the output, -1 for the output width
    pub width: i32,
    /// Height on the output, -1 for the output height
    pub height: i32,
    /// Left edge of the source rectangle, 16.16 fixed point
    pub src_x: i32,
    /// Top edge of the source rectangle, 16.16 fixed point
    pub src_y: i32,
    /// Width of the source rectangle, 16.16 fixed point, -1 for all of it
    pub src_width: i32,
    /// Height of the source rectangle, 16.16 fixed point, -1 for all of it
    pub src_height: i32,
    /// Opacity between 0 and 1
    pub alpha: f64,
    /// Blend mode
    pub blend: BlendMode,
    /// Rotation and reflection
    pub rotation: Rotation,
    /// Z position
    pub zorder: u32,
}

impl Default for PlaneParams {
    fn default() -> Self {
        PlaneParams {
            xpos: 0,
            ypos: 0,
            width: -1,
            height: -1,
            src_x: 0,
            src_y: 0,
            src_width: -1,
            src_height: -1,
            alpha: 1.0,
            blend: BlendMode::default(),
            rotation: Rotation::default(),
            zorder: 0,
        }
    }
}

impl PlaneParams {
    /// Value of the `alpha` plane property
    pub fn kms_alpha(&self) -> u16 {
        (f64::from(u16::MAX) * self.alpha) as u16
    }
}

/// Values of [`PLANE_PROPERTIES`](super::plane::PLANE_PROPERTIES) for an enabled plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneConfig {
    /// Framebuffer to scan out
    pub fb_id: u32,
    /// Destination position
    pub crtc_x: i32,
    /// Destination position
    pub crtc_y: i32,
    /// Destination size
    pub crtc_w: u32,
    /// Destination size
    pub crtc_h: u32,
    /// Source rectangle, 16.16 fixed point
    pub src_x: u32,
    /// Source rectangle, 16.16 fixed point
    pub src_y: u32,
    /// Source rectangle, 16.16 fixed point
    pub src_w: u32,
    /// Source rectangle, 16.16 fixed point
    pub src_h: u32,
    /// Plane alpha
    pub alpha: u16,
    /// Blend mode
    pub blend: BlendMode,
    /// Rotation
    pub rotation: Rotation,
    /// Z position
    pub zpos: u64,
}

impl PlaneConfig {
    /// Place a `frame`-sized input according to `params` on an `output`-sized frame.
    ///
    /// A crop meta moves the source origin into its region and bounds the source rectangle by
    /// the region's far edges. Returns `None` if the source rectangle starts outside of the
    /// visible frame or is left empty by the crop.
    pub fn new(
        params: &PlaneParams,
        fb_id: u32,
        frame: (u32, u32),
        crop: Option<&CropMeta>,
        output: (u32, u32),
    ) -> Option<PlaneConfig> {
        let crtc_w = if params.width < 0 { output.0 } else { params.width as u32 };
        let crtc_h = if params.height < 0 { output.1 } else { params.height as u32 };

        let mut src_x = u64::from(params.src_x.max(0) as u32);
        let mut src_y = u64::from(params.src_y.max(0) as u32);
        // -1 casts to the largest value and is clamped like any other
        let mut src_w = u64::from(params.src_width as u32);
        let mut src_h = u64::from(params.src_height as u32);
        if let Some(crop) = crop {
            src_x += u64::from(crop.x) << 16;
            src_y += u64::from(crop.y) << 16;
            let right = (u64::from(crop.x) + u64::from(crop.width)) << 16;
            let bottom = (u64::from(crop.y) + u64::from(crop.height)) << 16;
            src_w = src_w.min(right.saturating_sub(src_x));
            src_h = src_h.min(bottom.saturating_sub(src_y));
        }

        let max_w = u64::from(frame.0) << 16;
        let max_h = u64::from(frame.1) << 16;
        if src_x >= max_w || src_y >= max_h {
            trace!(src_x, src_y, "ignoring sink, requested region is off-picture");
            return None;
        }
        let src_w = src_w.min(max_w - src_x);
        let src_h = src_h.min(max_h - src_y);
        if src_w == 0 || src_h == 0 {
            trace!(src_x, src_y, "ignoring sink, cropped region is empty");
            return None;
        }

        let fixed = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        Some(PlaneConfig {
            fb_id,
            crtc_x: params.xpos,
            crtc_y: params.ypos,
            crtc_w,
            crtc_h,
            src_x: fixed(src_x),
            src_y: fixed(src_y),
            src_w: fixed(src_w),
            src_h: fixed(src_h),
            alpha: params.kms_alpha(),
            blend: params.blend,
            rotation: params.rotation,
            zpos: u64::from(params.zorder),
        })
    }

    fn values(&self, crtc: u32) -> [u64; 14] {
        [
            u64::from(self.fb_id),
            u64::from(crtc),
            // signed range properties take the two's complement
            i64::from(self.crtc_x) as u64,
            i64::from(self.crtc_y) as u64,
            u64::from(self.crtc_w),
            u64::from(self.crtc_h),
            u64::from(self.src_x),
            u64::from(self.src_y),
            u64::from(self.src_w),
            u64::from(self.src_h),
            u64::from(self.alpha),
            self.blend as u64,
            u64::from(self.rotation.bits()),
            self.zpos,
        ]
    }
}

/// What a plane shows in one commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneUpdate {
    /// The plane is switched off
    Disabled,
    /// The plane shows a framebuffer
    Enabled(PlaneConfig),
}

/// Property ids of the writeback connector and its crtc, read once on start
#[derive(Debug, Clone)]
pub struct OutputProperties {
    /// Connector id
    pub connector: u32,
    /// Crtc id
    pub crtc: u32,
    /// Connector properties in driver order
    pub connector_props: PropertyMap,
    /// Id of the crtc's `MODE_ID` property
    pub mode_id: Option<u32>,
    /// Id of the crtc's `ACTIVE` property
    pub active: Option<u32>,
}

/// Replace every character outside of `[A-Za-z0-9_]` by `-`
pub fn canonical_property_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

/// Build the request of one frame into `request`, clearing what it held before.
///
/// `mode_blob` is set when the commit has to apply a new mode. Returns the flags the
/// request has to be committed with.
#[profiling::function]
pub fn fill_request(
    request: &mut AtomicRequest,
    output: &OutputProperties,
    writeback_fb: u32,
    user_props: &IndexMap<String, u64>,
    mode_blob: Option<u64>,
    planes: &[(&PlaneBinding, PlaneUpdate)],
) -> Result<AtomicCommitFlags, Error> {
    request.clear();
    let objects = 1 + usize::from(mode_blob.is_some()) + planes.len();
    let props = 3 + user_props.len() + 2 + planes.len() * 14;
    request.reserve(objects, props);

    let fence_ptr = request.out_fence_ptr();
    let mut has_fb = false;
    let mut has_fence = false;
    request.begin_object(output.connector);
    for prop in output.connector_props.iter() {
        match prop.name.as_str() {
            "WRITEBACK_FB_ID" => {
                if has_fb {
                    warn!("Property WRITEBACK_FB_ID occurs twice");
                    continue;
                }
                request.push(prop.id, u64::from(writeback_fb));
                has_fb = true;
            }
            "WRITEBACK_OUT_FENCE_PTR" => {
                if has_fence {
                    warn!("Property WRITEBACK_OUT_FENCE_PTR occurs twice");
                    continue;
                }
                request.push(prop.id, fence_ptr);
                has_fence = true;
            }
            "CRTC_ID" => request.push(prop.id, u64::from(output.crtc)),
            name => {
                if let Some(value) = user_props.get(&canonical_property_name(name)) {
                    request.push(prop.id, *value);
                }
            }
        }
    }
    let missing = |name| Error::PropertyMissing {
        object: format!("connector {}", output.connector),
        name,
    };
    if !has_fb {
        return Err(missing("WRITEBACK_FB_ID"));
    }
    if !has_fence {
        return Err(missing("WRITEBACK_OUT_FENCE_PTR"));
    }

    let mut flags = AtomicCommitFlags::PAGE_FLIP_EVENT;
    if let Some(blob) = mode_blob {
        let missing = |name| Error::PropertyMissing {
            object: format!("crtc {}", output.crtc),
            name,
        };
        let mode_id = output.mode_id.ok_or_else(|| missing("MODE_ID"))?;
        let active = output.active.ok_or_else(|| missing("ACTIVE"))?;
        request.begin_object(output.crtc);
        request.push(mode_id, blob);
        request.push(active, 1);
        flags |= AtomicCommitFlags::ALLOW_MODESET;
    }

    for (plane, update) in planes {
        request.begin_object(plane.id);
        match update {
            PlaneUpdate::Disabled => {
                request.push(plane.prop_ids[FB_ID], 0);
                request.push(plane.prop_ids[CRTC_ID], 0);
            }
            PlaneUpdate::Enabled(config) => {
                trace!(plane = plane.id, ?config, "Setting plane");
                let values = config.values(output.crtc);
                let count = if plane.zpos_mutable { ZPOS + 1 } else { ZPOS };
                for (&id, &value) in plane.prop_ids.iter().zip(values.iter()).take(count) {
                    request.push(id, value);
                }
            }
        }
    }

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{
        canonical_property_name, fill_request, OutputProperties, PlaneConfig, PlaneParams, PlaneUpdate,
    };
    use crate::{
        backend::drm::{
            test::{DummyKmsDevice, DummyPlane, CRTC, FIRST_PLANE, WRITEBACK_CONNECTOR},
            AtomicCommitFlags, AtomicRequest, KmsDevice, ObjectId, PropertyMap,
        },
        backend::allocator::Fourcc,
        compositor::{
            connector::WritebackConnector,
            plane::{bind_planes, BlendMode, PlaneBinding, Rotation},
            Error,
        },
        video::CropMeta,
    };

    fn output(dev: &DummyKmsDevice) -> OutputProperties {
        OutputProperties {
            connector: WRITEBACK_CONNECTOR,
            crtc: CRTC,
            connector_props: PropertyMap::read(dev, ObjectId::Connector(WRITEBACK_CONNECTOR)).unwrap(),
            mode_id: dev.property_id(CRTC, "MODE_ID"),
            active: dev.property_id(CRTC, "ACTIVE"),
        }
    }

    fn planes(dev: &DummyKmsDevice) -> Vec<PlaneBinding> {
        let res = dev.resources().unwrap();
        let conn = WritebackConnector {
            id: WRITEBACK_CONNECTOR,
            crtc: CRTC,
            pipe: 0,
        };
        bind_planes(dev, &res, &conn, None).unwrap()
    }

    fn names(dev: &DummyKmsDevice, request: &AtomicRequest, object: u32) -> Vec<String> {
        let (props, _) = request.object(object).unwrap();
        props
            .iter()
            .map(|&id| dev.property(id).unwrap().name)
            .collect()
    }

    #[test]
    fn geometry_defaults_to_output_size() {
        let config = PlaneConfig::new(&PlaneParams::default(), 7, (640, 480), None, (1280, 720)).unwrap();
        assert_eq!((config.crtc_w, config.crtc_h), (1280, 720));
        assert_eq!((config.src_x, config.src_y), (0, 0));
        assert_eq!((config.src_w, config.src_h), (640 << 16, 480 << 16));
        assert_eq!(config.alpha, 0xFFFF);
        assert_eq!(config.blend, BlendMode::Coverage);
        assert_eq!(config.rotation, Rotation::ROTATE_0);
    }

    #[test]
    fn source_rect_is_clamped() {
        let params = PlaneParams {
            src_x: 100 << 16,
            src_width: 1000 << 16,
            src_height: 10 << 16,
            width: 320,
            height: 240,
            ..PlaneParams::default()
        };
        let config = PlaneConfig::new(&params, 7, (640, 480), None, (1280, 720)).unwrap();
        assert_eq!((config.crtc_w, config.crtc_h), (320, 240));
        assert_eq!(config.src_w, 540 << 16);
        assert_eq!(config.src_h, 10 << 16);
    }

    #[test]
    fn crop_meta_moves_source() {
        let crop = CropMeta {
            x: 16,
            y: 8,
            width: 100,
            height: 50,
        };
        let config = PlaneConfig::new(&PlaneParams::default(), 7, (640, 480), Some(&crop), (1280, 720)).unwrap();
        assert_eq!((config.src_x, config.src_y), (16 << 16, 8 << 16));
        assert_eq!((config.src_w, config.src_h), (100 << 16, 50 << 16));

        let params = PlaneParams {
            src_x: 4 << 16,
            ..PlaneParams::default()
        };
        let config = PlaneConfig::new(&params, 7, (640, 480), Some(&crop), (1280, 720)).unwrap();
        assert_eq!(config.src_x, 20 << 16);
        assert_eq!(config.src_y, 8 << 16);
        assert_eq!(config.src_w, 96 << 16);
        assert_eq!(config.src_h, 50 << 16);
    }

    #[test]
    fn crop_region_at_the_right_edge() {
        let crop = CropMeta {
            x: 600,
            y: 0,
            width: 40,
            height: 480,
        };
        let config = PlaneConfig::new(&PlaneParams::default(), 7, (640, 480), Some(&crop), (1280, 720)).unwrap();
        assert_eq!(config.src_x, 600 << 16);
        assert_eq!(config.src_w, 40 << 16);
        assert_eq!(config.src_h, 480 << 16);

        // a pad offset past the crop region leaves nothing to scan out
        let params = PlaneParams {
            src_x: 40 << 16,
            ..PlaneParams::default()
        };
        assert!(PlaneConfig::new(&params, 7, (1280, 480), Some(&crop), (1280, 720)).is_none());
    }

    #[test]
    fn off_picture_source() {
        let params = PlaneParams {
            src_x: 640 << 16,
            ..PlaneParams::default()
        };
        assert!(PlaneConfig::new(&params, 7, (640, 480), None, (1280, 720)).is_none());
        let params = PlaneParams {
            src_y: 481 << 16,
            ..PlaneParams::default()
        };
        assert!(PlaneConfig::new(&params, 7, (640, 480), None, (1280, 720)).is_none());
    }

    #[test]
    fn alpha_scaling() {
        let half = PlaneParams {
            alpha: 0.5,
            ..PlaneParams::default()
        };
        assert_eq!(half.kms_alpha(), 0x7FFF);
        let off = PlaneParams {
            alpha: 0.0,
            ..PlaneParams::default()
        };
        assert_eq!(off.kms_alpha(), 0);
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_property_name("content type"), "content-type");
        assert_eq!(canonical_property_name("WRITEBACK_FB_ID"), "WRITEBACK_FB_ID");
        assert_eq!(canonical_property_name("a.b:c"), "a-b-c");
    }

    #[test]
    fn full_request_layout() {
        let dev = DummyKmsDevice::builder()
            .connector_property("content type", 0)
            .connector_property("ignored prop", 0)
            .build();
        let out = output(&dev);
        let bound = planes(&dev);
        let config = PlaneConfig::new(&PlaneParams::default(), 77, (1280, 720), None, (1280, 720)).unwrap();
        let mut user = IndexMap::new();
        user.insert("content-type".to_owned(), 3u64);

        let mut request = AtomicRequest::new();
        let flags = fill_request(
            &mut request,
            &out,
            500,
            &user,
            Some(1000),
            &[(&bound[0], PlaneUpdate::Enabled(config)), (&bound[1], PlaneUpdate::Disabled)],
        )
        .unwrap();
        assert_eq!(
            flags,
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::ALLOW_MODESET
        );
        assert_eq!(request.object_count(), 4);
        assert_eq!(
            names(&dev, &request, WRITEBACK_CONNECTOR),
            vec!["CRTC_ID", "WRITEBACK_FB_ID", "WRITEBACK_OUT_FENCE_PTR", "content type"]
        );
        let fence_ptr = request.out_fence_ptr();
        let (_, values) = request.object(WRITEBACK_CONNECTOR).unwrap();
        assert_eq!(values, &[u64::from(CRTC), 500, fence_ptr, 3][..]);
        assert_eq!(names(&dev, &request, CRTC), vec!["MODE_ID", "ACTIVE"]);
        assert_eq!(request.object(FIRST_PLANE).unwrap().0.len(), 14);
        assert_eq!(request.object(FIRST_PLANE + 1).unwrap().1, &[0u64, 0][..]);
        assert_eq!(names(&dev, &request, FIRST_PLANE + 1), vec!["FB_ID", "CRTC_ID"]);
    }

    #[test]
    fn steady_state_request() {
        let dev = DummyKmsDevice::new();
        let out = output(&dev);
        let bound = planes(&dev);
        let mut request = AtomicRequest::new();
        let flags = fill_request(&mut request, &out, 500, &IndexMap::new(), None, &[(&bound[0], PlaneUpdate::Disabled)])
            .unwrap();
        assert_eq!(flags, AtomicCommitFlags::PAGE_FLIP_EVENT);
        assert!(request.object(CRTC).is_none());
        assert_eq!(request.object_count(), 2);
    }

    #[test]
    fn duplicate_writeback_property_is_skipped() {
        let dev = DummyKmsDevice::builder().duplicate_writeback_fb_property().build();
        let out = output(&dev);
        let mut request = AtomicRequest::new();
        fill_request(&mut request, &out, 500, &IndexMap::new(), None, &[]).unwrap();
        let names = names(&dev, &request, WRITEBACK_CONNECTOR);
        assert_eq!(names.iter().filter(|n| *n == "WRITEBACK_FB_ID").count(), 1);
    }

    #[test]
    fn fixed_zpos_is_not_committed() {
        let dev = DummyKmsDevice::builder()
            .planes(vec![DummyPlane::primary(&[Fourcc::Xrgb8888]).fixed_zpos()])
            .build();
        let out = output(&dev);
        let bound = planes(&dev);
        let config = PlaneConfig::new(&PlaneParams::default(), 77, (64, 64), None, (1280, 720)).unwrap();
        let mut request = AtomicRequest::new();
        fill_request(&mut request, &out, 500, &IndexMap::new(), None, &[(&bound[0], PlaneUpdate::Enabled(config))])
            .unwrap();
        let names = names(&dev, &request, FIRST_PLANE);
        assert_eq!(names.len(), 13);
        assert!(!names.iter().any(|n| n == "zpos"));
    }

    #[test]
    fn missing_crtc_property() {
        let dev = DummyKmsDevice::new();
        let mut out = output(&dev);
        out.active = None;
        let mut request = AtomicRequest::new();
        assert!(matches!(
            fill_request(&mut request, &out, 500, &IndexMap::new(), Some(1000), &[]),
            Err(Error::PropertyMissing { name: "ACTIVE", .. })
        ));
    }
}
