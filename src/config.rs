//! Process-wide convolution flags.
//!
//! These mirror the global switches a host framework exposes for its
//! accelerated convolution path. They are read once per call through
//! [`ConvOptions::from_globals`]; callers that want per-call control build a
//! [`ConvOptions`] directly instead.
//!
//! | flag            | default | environment variable        |
//! |-----------------|---------|-----------------------------|
//! | `deterministic` | `false` | `BRINY_CONV_DETERMINISTIC`  |
//! | `allow_tf32`    | `true`  | `BRINY_CONV_ALLOW_TF32`     |
//! | `benchmark`     | `false` | `BRINY_CONV_BENCHMARK`      |
//!
//! The backend can also be chosen with `BRINY_CONV_BACKEND` (`cpu` or `wgpu`).

use crate::backend::{Backend, set_backend};
use core::sync::atomic::{AtomicBool, Ordering};

static DETERMINISTIC: AtomicBool = AtomicBool::new(false);
static ALLOW_TF32: AtomicBool = AtomicBool::new(true);
static BENCHMARK: AtomicBool = AtomicBool::new(false);

/// Requires engines that produce bit-identical results across runs.
pub fn set_deterministic(on: bool) {
    DETERMINISTIC.store(on, Ordering::Release);
}

/// Whether deterministic engines are required.
pub fn get_deterministic() -> bool {
    DETERMINISTIC.load(Ordering::Acquire)
}

/// Allows reduced-precision (tensor-core style) engines for non-`Float` inputs.
pub fn set_allow_tf32(on: bool) {
    ALLOW_TF32.store(on, Ordering::Release);
}

/// Whether reduced-precision engines are allowed.
pub fn get_allow_tf32() -> bool {
    ALLOW_TF32.load(Ordering::Acquire)
}

/// Requests benchmarking of candidate engines. Not supported; convolutions
/// fail with [`crate::error::ConvError::BenchmarkUnsupported`] while set.
pub fn set_benchmark(on: bool) {
    BENCHMARK.store(on, Ordering::Release);
}

/// Whether benchmarking was requested.
pub fn get_benchmark() -> bool {
    BENCHMARK.load(Ordering::Acquire)
}

/// Per-call selection options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
    /// Autotune candidates instead of trusting heuristic rank. Rejected.
    pub benchmark: bool,
    /// Drop engines flagged non-deterministic.
    pub deterministic: bool,
    /// Permit down-converting and tensor-core engines for non-`Float` inputs.
    pub allow_tf32: bool,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            benchmark: false,
            deterministic: false,
            allow_tf32: true,
        }
    }
}

impl ConvOptions {
    /// Snapshot of the global flags.
    pub fn from_globals() -> Self {
        Self {
            benchmark: get_benchmark(),
            deterministic: get_deterministic(),
            allow_tf32: get_allow_tf32(),
        }
    }

    /// Returns a copy with `deterministic` set.
    #[must_use]
    pub const fn deterministic(mut self, on: bool) -> Self {
        self.deterministic = on;
        self
    }

    /// Returns a copy with `allow_tf32` set.
    #[must_use]
    pub const fn allow_tf32(mut self, on: bool) -> Self {
        self.allow_tf32 = on;
        self
    }

    /// Returns a copy with `benchmark` set.
    #[must_use]
    pub const fn benchmark(mut self, on: bool) -> Self {
        self.benchmark = on;
        self
    }
}

/// Parses the boolean spellings accepted in environment variables.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_flag(name: &str, value: Option<String>, set: fn(bool)) {
    let Some(value) = value else { return };
    match parse_flag(&value) {
        Some(on) => set(on),
        None => log::warn!("ignoring {name}={value:?}: expected a boolean"),
    }
}

/// Applies the `BRINY_CONV_*` environment variables to the global state.
///
/// Variables that are unset are left alone; unparseable values are ignored
/// with a warning.
pub fn load_from_env() {
    load_from(|name| std::env::var(name).ok());
}

/// Same as [`load_from_env`] with a custom variable lookup.
pub fn load_from(lookup: impl Fn(&str) -> Option<String>) {
    apply_flag("BRINY_CONV_DETERMINISTIC", lookup("BRINY_CONV_DETERMINISTIC"), set_deterministic);
    apply_flag("BRINY_CONV_ALLOW_TF32", lookup("BRINY_CONV_ALLOW_TF32"), set_allow_tf32);
    apply_flag("BRINY_CONV_BENCHMARK", lookup("BRINY_CONV_BENCHMARK"), set_benchmark);

    if let Some(value) = lookup("BRINY_CONV_BACKEND") {
        match value.parse::<Backend>() {
            Ok(b) => set_backend(b),
            Err(()) => log::warn!("ignoring BRINY_CONV_BACKEND={value:?}: unknown backend"),
        }
    }
}
