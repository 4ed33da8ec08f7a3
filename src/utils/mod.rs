//! Various utilities functions and types

mod fd;
pub mod mmap;

pub use self::fd::{DevPath, DeviceFd};
pub use self::mmap::Mapping;

/// Reads a boolean toggle from the environment.
///
/// `1`, `true`, `yes` and `y` (case-insensitive) enable the toggle,
/// anything else, including an unset variable, disables it.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|x| {
            x == "1"
                || x.to_lowercase() == "true"
                || x.to_lowercase() == "yes"
                || x.to_lowercase() == "y"
        })
        .unwrap_or(false)
}
