use std::{os::unix::io::RawFd, time::Duration};

use indexmap::IndexMap;
use tracing::warn;

use super::plane::{BlendMode, Rotation};
use crate::utils::env_flag;

/// Environment variable enabling request dumps of failed commits
pub const DEBUG_COMMIT_ENV: &str = "KMS_COMPOSITOR_DEBUG_COMMIT";
/// Environment variable limiting the number of planes bound on start
pub const MAX_PLANES_ENV: &str = "KMS_COMPOSITOR_MAX_PLANES";

/// Configuration of a [`KmsCompositor`](super::KmsCompositor)
#[derive(Debug, Clone, PartialEq)]
pub struct CompositorSettings {
    /// Drm driver to open
    pub driver_name: Option<String>,
    /// Bus id of the device to open
    pub bus_id: Option<String>,
    /// Writeback connector to use, picked automatically if `None`
    pub connector_id: Option<u32>,
    /// Additional connector properties set on every commit
    pub connector_properties: IndexMap<String, u64>,
    /// Already opened drm fd. It is duplicated when set, the caller keeps ownership.
    pub fd: Option<RawFd>,
    /// Assume downstream handles dma-buf memory even if it does not say so
    pub force_dma: bool,
    /// How long to wait for the writeback fence
    pub fence_timeout: Duration,
    /// How long to wait for the page flip event of our crtc
    pub event_timeout: Duration,
    /// Upper bound of planes bound as sink pads, all eligible planes if `None`
    pub max_planes: Option<usize>,
    /// Dump the request of failed commits
    pub debug_commits: bool,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        CompositorSettings {
            driver_name: None,
            bus_id: None,
            connector_id: None,
            connector_properties: IndexMap::new(),
            fd: None,
            force_dma: false,
            fence_timeout: Duration::from_secs(3),
            event_timeout: Duration::from_secs(3),
            max_planes: None,
            debug_commits: false,
        }
    }
}

impl CompositorSettings {
    /// Default settings with the environment overrides applied
    pub fn from_env() -> CompositorSettings {
        let mut settings = CompositorSettings {
            debug_commits: env_flag(DEBUG_COMMIT_ENV),
            ..CompositorSettings::default()
        };
        if let Ok(value) = std::env::var(MAX_PLANES_ENV) {
            match value.trim().parse::<usize>() {
                Ok(max) => settings.max_planes = Some(max),
                Err(err) => warn!(%value, ?err, "Ignoring invalid {}", MAX_PLANES_ENV),
            }
        }
        settings
    }
}

/// Value of a string-keyed property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Boolean property
    Bool(bool),
    /// Signed integer property
    Int(i64),
    /// Unsigned integer property
    UInt(u64),
    /// Floating point property
    Double(f64),
    /// Nullable string property
    String(Option<String>),
    /// Name to value map
    Map(IndexMap<String, u64>),
    /// Plane blend mode
    Blend(BlendMode),
    /// Plane rotation
    Rotation(Rotation),
}

impl PropertyValue {
    pub(crate) fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    // unsigned values are accepted for signed properties and vice versa
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}
