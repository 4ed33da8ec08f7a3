//! Caps of the writeback output and of plane inputs.

use tracing::{debug, info};

use super::Error;
use crate::{
    backend::{
        allocator::format::video_format_from_raw,
        drm::{error::AccessContext, ConnectorInfo, KmsDevice, PropertyMap, Resources},
    },
    video::{
        caps::{ANY_FRAMERATE, MAX_DIMENSION},
        CapsStructure, Fraction, Range, VideoCaps, VideoFormat,
    },
};

/// Framerate the output fixates to if no input has one
pub const DEFAULT_FRAMERATE: Fraction = Fraction::new(25, 1);

fn formats_from_raw<'a>(codes: impl IntoIterator<Item = &'a u32>, what: &str) -> Vec<VideoFormat> {
    codes
        .into_iter()
        .filter(|&&code| code != 0)
        .filter_map(|&code| {
            let format = video_format_from_raw(code);
            if format.is_none() {
                info!(
                    "ignoring {} {}",
                    what,
                    drm_fourcc::DrmFourcc::try_from(code)
                        .map(|f| format!("{:?}", f))
                        .unwrap_or_else(|_| format!("{:#010x}", code))
                );
            }
            format
        })
        .collect()
}

fn dimension(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(MAX_DIMENSION)
}

/// Caps a plane supporting the raw fourcc `formats` accepts
pub fn plane_sink_caps(formats: &[u32], res: &Resources) -> VideoCaps {
    formats_from_raw(formats, "format")
        .into_iter()
        .map(|format| {
            CapsStructure::new([format])
                .with_size(
                    Range::new(dimension(res.min_width), dimension(res.max_width)),
                    Range::new(dimension(res.min_height), dimension(res.max_height)),
                )
                .with_framerate(ANY_FRAMERATE)
        })
        .collect::<VideoCaps>()
        .simplify()
}

/// Caps the writeback connector can produce.
///
/// Formats come from the `WRITEBACK_PIXEL_FORMATS` blob, sizes from the connector modes.
/// With `prime_export` every configuration is offered a second time in dma-buf memory.
pub fn writeback_caps(
    device: &dyn KmsDevice,
    props: &PropertyMap,
    conn: &ConnectorInfo,
    prime_export: bool,
) -> Result<VideoCaps, Error> {
    let blob_id = props
        .get("WRITEBACK_PIXEL_FORMATS")
        .map(|entry| entry.value)
        .ok_or_else(|| Error::PropertyMissing {
            object: format!("connector {}", conn.id),
            name: "WRITEBACK_PIXEL_FORMATS",
        })?;
    let blob = device
        .property_blob(blob_id)
        .access("Failed to read writeback formats", device)
        .map_err(Error::ResourceEnumerationFailed)?;
    let codes = blob
        .chunks_exact(4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect::<Vec<_>>();

    let formats = formats_from_raw(&codes, "output format");
    if formats.is_empty() {
        return Err(Error::CapsUnsupported);
    }
    let format_caps = formats
        .into_iter()
        .map(|format| CapsStructure::new([format]))
        .collect::<VideoCaps>()
        .simplify();

    let mode_caps = conn
        .modes
        .iter()
        .map(|mode| {
            CapsStructure::new(VideoFormat::ALL.iter().copied())
                .with_size(
                    Range::fixed(i32::from(mode.hdisplay)),
                    Range::fixed(i32::from(mode.vdisplay)),
                )
                .with_framerate(ANY_FRAMERATE)
        })
        .collect::<VideoCaps>();

    let mut caps = format_caps.intersect(&mode_caps);
    if caps.is_empty() {
        return Err(Error::CapsUnsupported);
    }
    if prime_export {
        let dmabuf = caps
            .iter()
            .map(|s| s.clone().with_dmabuf(true))
            .collect::<VideoCaps>();
        caps.append(dmabuf);
    }
    let caps = caps.simplify();
    debug!(%caps, "Writeback caps");
    Ok(caps)
}

/// Fixate output caps to the fastest input framerate and the dominant input's aspect ratio.
///
/// `framerates` are the rates of all negotiated inputs, a zero denominator counts as zero fps.
pub fn fixate_src_caps(
    caps: &VideoCaps,
    framerates: impl IntoIterator<Item = Fraction>,
    par: Option<Fraction>,
) -> VideoCaps {
    let mut best: Option<(f64, Fraction)> = None;
    for fps in framerates {
        let value = if fps.den == 0 { 0.0 } else { fps.as_f64() };
        if best.map_or(true, |(b, _)| value > b) {
            best = Some((value, fps));
        }
    }
    let target = match best {
        Some((value, fps)) if value > 0.0 && fps.num > 0 && fps.den > 0 => fps,
        _ => DEFAULT_FRAMERATE,
    };

    let Some(first) = caps.structure(0) else {
        return VideoCaps::new_empty();
    };
    let mut structure = first.clone();
    structure.fixate_framerate_nearest(target);
    if let Some(par) = par {
        structure.fixate_pixel_aspect_ratio_nearest(par);
    }
    VideoCaps::new(structure).fixate()
}
