//! Backend selection module.
//!
//! This module defines the accelerator runtimes a convolution can be routed
//! to and provides functions to set and get the current one.
//!
//! # Supported Backends
//!
//! - `Cpu` — Reference runtime built on `rayon` (default).
//! - `Wgpu` — GPU runtime using `wgpu` (requires the `wgpu` feature).
//!
//! The backend is stored globally using an `AtomicU8`, enabling fast
//! switching between runtimes at runtime. Selecting `Wgpu` in a build without
//! the feature, or on a machine without a usable adapter, routes to `Cpu`
//! with a warning.

use core::convert::TryFrom;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported accelerator runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Reference CPU runtime (default).
    #[default]
    Cpu = 0,
    /// GPU runtime using `wgpu`.
    Wgpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Internal global state for the active backend.
///
/// Relaxed consistency is enough here; the backend is expected to change
/// rarely and never in the middle of a convolution call.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the active backend used by [`crate::conv::convolution`].
///
/// # Example
///
/// ```
/// use briny_conv::backend::{set_backend, get_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the currently active backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
