//! Writeback connector and crtc selection.

use tracing::{debug, error, info, trace};

use super::Error;
use crate::backend::drm::{ConnectorInfo, KmsDevice, Mode, Resources};

/// The writeback connector the compositor renders into, with the crtc driving it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritebackConnector {
    /// Connector id
    pub id: u32,
    /// Crtc id
    pub crtc: u32,
    /// Index of the crtc in the resource list, used to match plane masks
    pub pipe: u32,
}

/// Find the crtc a connector is, or can be, driven by.
///
/// Returns the crtc id and its index in `res.crtcs`.
pub fn resolve_crtc(device: &dyn KmsDevice, res: &Resources, conn: &ConnectorInfo) -> Option<(u32, u32)> {
    if let Some(crtc) = conn
        .current_encoder
        .and_then(|enc| device.encoder(enc).ok())
        .and_then(|enc| enc.crtc)
    {
        if let Some(pipe) = res.crtcs.iter().position(|&c| c == crtc) {
            return Some((crtc, pipe as u32));
        }
    }

    let possible = conn
        .encoders
        .iter()
        .filter_map(|&enc| device.encoder(enc).ok())
        .fold(0u32, |mask, enc| mask | enc.possible_crtcs);
    if possible == 0 {
        return None;
    }
    let pipe = possible.trailing_zeros();
    res.crtcs.get(pipe as usize).map(|&crtc| (crtc, pipe))
}

fn writeback_connectors<'a>(
    device: &'a dyn KmsDevice,
    res: &'a Resources,
) -> impl Iterator<Item = ConnectorInfo> + 'a {
    res.connectors
        .iter()
        .filter_map(move |&id| device.connector(id).ok())
        .filter(ConnectorInfo::is_writeback)
}

/// Pick the writeback connector to use.
///
/// A `requested` connector must be a writeback connector. Otherwise the first writeback
/// connector whose crtc is currently scanning out wins, then the first one any crtc can drive.
pub fn select_connector(
    device: &dyn KmsDevice,
    res: &Resources,
    requested: Option<u32>,
) -> Result<WritebackConnector, Error> {
    if let Some(id) = requested {
        let conn = device
            .connector(id)
            .map_err(|_| Error::NoWritebackConnector { requested })?;
        if !conn.is_writeback() {
            error!("User-defined connector {} is not a writeback connector", id);
            return Err(Error::NoWritebackConnector { requested });
        }
        let (crtc, pipe) = resolve_crtc(device, res, &conn).ok_or(Error::NoCompatibleCrtc(id))?;
        debug!(connector = id, crtc, pipe, "Using user-defined connector");
        return Ok(WritebackConnector { id, crtc, pipe });
    }

    for conn in writeback_connectors(device, res) {
        let Some((crtc, pipe)) = resolve_crtc(device, res, &conn) else {
            continue;
        };
        let active = device
            .crtc(crtc)
            .map(|info| info.framebuffer.is_some())
            .unwrap_or(false);
        if active {
            info!(connector = conn.id, crtc, "Found active connector");
            return Ok(WritebackConnector { id: conn.id, crtc, pipe });
        }
    }

    let mut unresolved = None;
    for conn in writeback_connectors(device, res) {
        match resolve_crtc(device, res, &conn) {
            Some((crtc, pipe)) => {
                debug!(connector = conn.id, crtc, pipe, "Using first writeback connector");
                return Ok(WritebackConnector { id: conn.id, crtc, pipe });
            }
            None => {
                trace!(connector = conn.id, "No crtc for writeback connector");
                unresolved.get_or_insert(conn.id);
            }
        }
    }

    Err(match unresolved {
        Some(id) => Error::NoCompatibleCrtc(id),
        None => Error::NoWritebackConnector { requested: None },
    })
}

/// First mode of `conn` with the given visible size
pub fn find_mode(conn: &ConnectorInfo, width: u32, height: u32) -> Option<&Mode> {
    conn.modes
        .iter()
        .find(|mode| u32::from(mode.hdisplay) == width && u32::from(mode.vdisplay) == height)
}

#[cfg(test)]
mod tests {
    use super::{find_mode, resolve_crtc, select_connector, WritebackConnector};
    use crate::{
        backend::drm::{
            test::{DummyKmsDevice, CRTC, HDMI_CONNECTOR, WRITEBACK_CONNECTOR},
            KmsDevice,
        },
        compositor::Error,
    };

    #[test]
    fn auto_selects_writeback_connector() {
        let dev = DummyKmsDevice::new();
        let res = dev.resources().unwrap();
        let conn = select_connector(&*dev, &res, None).unwrap();
        assert_eq!(
            conn,
            WritebackConnector {
                id: WRITEBACK_CONNECTOR,
                crtc: CRTC,
                pipe: 0,
            }
        );
    }

    #[test]
    fn active_crtc_is_found() {
        let dev = DummyKmsDevice::new();
        dev.set_crtc_framebuffer(CRTC, 77);
        let res = dev.resources().unwrap();
        assert_eq!(select_connector(&*dev, &res, None).unwrap().crtc, CRTC);
    }

    #[test]
    fn requested_connector_must_be_writeback() {
        let dev = DummyKmsDevice::new();
        let res = dev.resources().unwrap();
        assert!(matches!(
            select_connector(&*dev, &res, Some(HDMI_CONNECTOR)),
            Err(Error::NoWritebackConnector {
                requested: Some(HDMI_CONNECTOR)
            })
        ));
        assert!(matches!(
            select_connector(&*dev, &res, Some(1234)),
            Err(Error::NoWritebackConnector { requested: Some(1234) })
        ));
        assert_eq!(
            select_connector(&*dev, &res, Some(WRITEBACK_CONNECTOR)).unwrap().id,
            WRITEBACK_CONNECTOR
        );
    }

    #[test]
    fn no_writeback_connector() {
        let dev = DummyKmsDevice::builder().without_writeback().build();
        let res = dev.resources().unwrap();
        assert!(matches!(
            select_connector(&*dev, &res, None),
            Err(Error::NoWritebackConnector { requested: None })
        ));
    }

    #[test]
    fn crtc_from_lowest_possible_bit() {
        let dev = DummyKmsDevice::new();
        let mut res = dev.resources().unwrap();
        let conn = dev.connector(WRITEBACK_CONNECTOR).unwrap();
        assert_eq!(resolve_crtc(&*dev, &res, &conn), Some((CRTC, 0)));

        res.crtcs.clear();
        assert_eq!(resolve_crtc(&*dev, &res, &conn), None);
        // a connector without encoders cannot be driven
        let hdmi = dev.connector(HDMI_CONNECTOR).unwrap();
        assert_eq!(resolve_crtc(&*dev, &dev.resources().unwrap(), &hdmi), None);
    }

    #[test]
    fn mode_lookup_by_size() {
        let dev = DummyKmsDevice::new();
        let conn = dev.connector(WRITEBACK_CONNECTOR).unwrap();
        assert_eq!(find_mode(&conn, 1920, 1080).unwrap().size(), (1920, 1080));
        assert!(find_mode(&conn, 800, 600).is_none());
    }
}
