//! briny_conv: heuristic execution-plan selection for tensor convolution.
//!
//! A forward convolution is described once as an operation graph and handed
//! to an accelerator runtime. The runtime's heuristics rank candidate
//! engines, the caller's policy removes the ones it may not use, and the
//! first remaining candidate that both compiles and executes produces the
//! output. Nothing is benchmarked.
//!
//! # Features
//!
//! - N-d convolution with stride, padding, dilation and groups
//! - `f16`, `f32` and `f64` operands in row-major or channels-last layout
//! - Determinism and reduced-precision policy applied before execution
//! - A parallel CPU runtime and an opt-in WGPU runtime
//!
//! # Modules
//!
//! - [`conv`] — Entry points
//! - [`filter`] — Policy filtering of engine candidates
//! - [`plan`] — Plan compilation and the first-viable execution loop
//! - [`runtime`] — Accelerator bindings
//! - [`descriptor`], [`graph`] — Problem description handed to runtimes
//! - [`tensor`], [`dtype`], [`shape`] — Operands and shape bookkeeping
//! - [`backend`], [`config`] — Global switches
//!
//! # Example
//!
//! ```rust
//! use briny_conv::prelude::*;
//!
//! let x = Tensor::from_vec(vec![1, 1, 3, 3], vec![1.0f32; 9]);
//! let w = Tensor::from_vec(vec![1, 1, 2, 2], vec![1.0f32; 4]);
//! let y = convolution(&x, &w, &ConvParams::new(2), &ConvOptions::default())?;
//! assert_eq!(y.shape(), &[1, 1, 2, 2]);
//! assert_eq!(y.to_vec_f64(), vec![4.0; 4]);
//! # Ok::<(), ConvError>(())
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod conv;
pub mod descriptor;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod filter;
pub mod graph;
pub mod plan;
pub mod runtime;
pub mod shape;
pub mod tensor;

/// Items most callers need.
pub mod prelude {
    pub use crate::backend::{Backend, get_backend, set_backend};
    pub use crate::config::ConvOptions;
    pub use crate::conv::{convolution, convolution_selection, convolution_with};
    pub use crate::dtype::DataType;
    pub use crate::error::ConvError;
    pub use crate::runtime::cpu::CpuRuntime;
    pub use crate::shape::ConvParams;
    pub use crate::tensor::{DeviceId, MemoryFormat, Tensor};
}
