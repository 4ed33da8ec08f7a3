use std::{io, path::PathBuf};

/// A failed ioctl on a KMS device
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Raw OS error code of the failed call, if any
    pub fn errno(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

/// Wrap an [`io::Error`] of a device call into an [`AccessError`]
pub(crate) trait AccessContext<T> {
    fn access(self, errmsg: &'static str, dev: &dyn super::KmsDevice) -> Result<T, AccessError>;
}

impl<T> AccessContext<T> for io::Result<T> {
    fn access(self, errmsg: &'static str, dev: &dyn super::KmsDevice) -> Result<T, AccessError> {
        self.map_err(|source| AccessError {
            errmsg,
            dev: dev.dev_path(),
            source,
        })
    }
}
