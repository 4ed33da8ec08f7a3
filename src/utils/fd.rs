use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::Arc,
};

/// Shared descriptor of a drm node, either opened by the crate or adopted from the caller
///
/// Clones share one descriptor. It is closed once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl PartialEq for DeviceFd {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

impl AsFd for DeviceFd {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for DeviceFd {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl From<OwnedFd> for DeviceFd {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}

impl DeviceFd {
    /// Adopt a drm fd handed in by the application.
    ///
    /// The descriptor is duplicated, so the application stays responsible for closing `fd`
    /// and the compositor may outlive it.
    pub fn duplicate(fd: BorrowedFd<'_>) -> std::io::Result<DeviceFd> {
        let owned = rustix::io::fcntl_dupfd_cloexec(fd, 0)?;
        Ok(DeviceFd::from(owned))
    }
}

/// Node path of an open descriptor, used to name the device in logs and errors
pub trait DevPath {
    /// Resolve the path through `/proc/self/fd`, `None` if it cannot be read
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.as_fd().as_raw_fd())).ok()
    }
}
