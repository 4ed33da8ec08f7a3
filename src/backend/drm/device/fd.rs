use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use drm::{control::Device as ControlDevice, Device as BasicDevice};
use rustix::fs::{Mode, OFlags};
use tracing::{debug, error, info, warn};

use crate::utils::{DevPath, DeviceFd};

/// Drivers tried in order when neither a driver name nor a bus id is configured
pub const DRIVER_PROBE_LIST: &[&str] = &[
    "i915",
    "radeon",
    "nouveau",
    "vmwgfx",
    "exynos",
    "amdgpu",
    "imx-drm",
    "imx-lcdif",
    "rockchip",
    "atmel-hlcdc",
    "msm",
    "xlnx",
    "vc4",
    "meson",
    "stm",
    "sun4i-drm",
    "mxsfb-drm",
    "tegra",
    "tidss",
    "xilinx_drm",
];

const DRI_DIR: &str = "/dev/dri";

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: DeviceFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// `DeviceFd`, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
        };

        // Atomic commits need master on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Adopt a descriptor owned by somebody else.
    ///
    /// The descriptor is duplicated, the caller keeps ownership of `fd`.
    /// Fails with `InvalidInput` if `fd` is not a drm device.
    pub fn adopt(fd: BorrowedFd<'_>) -> io::Result<DrmDeviceFd> {
        let fd = DeviceFd::duplicate(fd)?;
        let dev = DrmDeviceFd::new(fd);
        if dev.get_driver().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor is not a drm device",
            ));
        }
        Ok(dev)
    }

    /// Open the first primary node matching `driver` and `bus_id`.
    ///
    /// `None` matches anything.
    pub fn open(driver: Option<&str>, bus_id: Option<&str>) -> io::Result<DrmDeviceFd> {
        let mut nodes = primary_nodes()?;
        nodes.sort();

        for path in nodes {
            let fd = match rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => DeviceFd::from(fd),
                Err(err) => {
                    debug!(?path, ?err, "Unable to open drm node");
                    continue;
                }
            };
            if node_matches(&fd, driver, bus_id) {
                info!(?path, ?driver, ?bus_id, "Opened drm device");
                return Ok(DrmDeviceFd::new(fd));
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no drm device for driver {:?} and bus id {:?}", driver, bus_id),
        ))
    }

    /// Try the drivers of [`DRIVER_PROBE_LIST`] in order and open the first available one.
    pub fn probe() -> io::Result<(DrmDeviceFd, &'static str)> {
        for driver in DRIVER_PROBE_LIST {
            if let Ok(dev) = DrmDeviceFd::open(Some(driver), None) {
                return Ok((dev, driver));
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no known drm driver could be opened",
        ))
    }

    /// Returns the underlying `DeviceFd`
    pub fn device_fd(&self) -> DeviceFd {
        self.0.fd.clone()
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

fn primary_nodes() -> io::Result<Vec<PathBuf>> {
    Ok(std::fs::read_dir(DRI_DIR)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_primary_node(path))
        .collect())
}

fn is_primary_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("card"))
        .map_or(false, |index| index.parse::<u32>().is_ok())
}

struct Probe<'a>(BorrowedFd<'a>);

impl AsFd for Probe<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0
    }
}
impl BasicDevice for Probe<'_> {}

/// Whether `fd` refers to a drm device
pub fn is_drm_device(fd: BorrowedFd<'_>) -> bool {
    Probe(fd).get_driver().is_ok()
}

fn node_matches(fd: &DeviceFd, driver: Option<&str>, bus_id: Option<&str>) -> bool {
    let probe = Probe(fd.as_fd());
    if let Some(driver) = driver {
        match probe.get_driver() {
            Ok(info) if info.name().to_string_lossy() == driver => {}
            _ => return false,
        }
    }
    if let Some(bus_id) = bus_id {
        match probe.get_bus_id() {
            Ok(unique) => {
                let unique = unique.to_string_lossy();
                if unique.trim_start_matches("pci:") != bus_id.trim_start_matches("pci:") {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    true
}
