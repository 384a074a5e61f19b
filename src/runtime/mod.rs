//! # Accelerator Runtimes
//!
//! A runtime owns the three things the convolution path cannot do itself:
//! device execution contexts, heuristic ranking of engine configurations and
//! compiling/dispatching plans.
//!
//! ## Submodules
//!
//! - [`cpu`] — Reference runtime on `rayon` (always available)
//! - [`wgpu`] *(opt-in)* — WGSL compute pipelines using `wgpu`
//!
//! ## Adding a Runtime
//!
//! 1. Implement [`PlanBackend`] (compile and execute)
//! 2. Implement [`Runtime`] (context provider and heuristics)
//! 3. Route to it from [`crate::conv::convolution`]
//!
//! ## Feature Flags
//!
//! - `wgpu` — Enables the `wgpu` runtime

use crate::engine::{EngineConfig, HeuristicMode};
use crate::error::ConvError;
use crate::graph::OperationGraph;
use crate::plan::PlanBackend;
use crate::tensor::DeviceId;
use std::sync::Arc;

pub mod cpu;

#[cfg(feature = "wgpu")]
pub mod wgpu;

/// A complete accelerator binding.
pub trait Runtime: PlanBackend {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The calling thread's execution context for `device`, created on first use.
    fn context(&self, device: DeviceId) -> Result<Arc<Self::Context>, ConvError>;

    /// Candidate engines for `graph`, best first. May be empty, and may
    /// contain engines that turn out not to compile.
    fn engine_configs(&self, graph: &OperationGraph<Self::Context>, mode: HeuristicMode) -> Vec<EngineConfig>;
}
