//! Parallel CPU runtime
//!
//! # CPU Runtime
//!
//! This module provides the reference accelerator binding: a set of
//! convolution engines with deliberately different numerical behaviour, a
//! cost-model heuristic that ranks them, and plans that execute on the
//! global `rayon` pool.
//!
//! ## Engines
//!
//! | id | name           | notes                  | workspace            |
//! |----|----------------|------------------------|----------------------|
//! | 0  | `direct`       | —                      | 0                    |
//! | 1  | `im2col_gemm`  | —                      | `cin·k·out` elements |
//! | 2  | `split_reduce` | `NONDETERMINISTIC`     | 0                    |
//! | 3  | `down_convert` | `DOWN_CONVERT_INPUTS`  | 0                    |
//! | 4  | `tf32`         | `TENSOR_CORE`          | 0                    |
//!
//! `im2col_gemm` rejects grouped convolutions and problems whose column
//! matrix exceeds the runtime's workspace limit; `down_convert` has no
//! narrower type for `f16`; `tf32` accepts only 16-byte aligned `f32`
//! operands. Heuristics still suggest them; compilation decides.

mod kernels;

pub use kernels::im2col_workspace_size;

use crate::context::ContextPool;
use crate::descriptor::{OperandRole, OperationNode};
use crate::dtype::{DataType, Element};
use crate::engine::{EngineConfig, HeuristicMode, NumericalNotes};
use crate::error::{ConvError, EngineCompileError, EngineExecError, ExecFailure};
use crate::graph::OperationGraph;
use crate::plan::{DataPtr, ExecutionPlan, PlanBackend, VariantPack, take_read, take_write};
use crate::runtime::Runtime;
use crate::shape::ConvGeometry;
use crate::tensor::{DeviceId, Storage};
use half::f16;
use kernels::{Blend, Layout, Precision};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::ThreadId;

/// Reductions at least this long favour `split_reduce`.
const SPLIT_REDUCE_THRESHOLD: usize = 4096;

/// Alignment `tf32` needs on every operand.
const TF32_ALIGNMENT: usize = 16;

lazy_static::lazy_static! {
    static ref CPU_CONTEXTS: ContextPool<CpuContext> = ContextPool::new();
}

/// Execution context of one CPU "device" on one thread.
#[derive(Debug)]
pub struct CpuContext {
    pub device: DeviceId,
    pub owner: ThreadId,
    pub threads: usize,
}

impl CpuContext {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            owner: std::thread::current().id(),
            threads: rayon::current_num_threads(),
        }
    }
}

/// The CPU engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEngine {
    Direct,
    Im2colGemm,
    SplitReduce,
    DownConvert,
    Tf32,
}

impl CpuEngine {
    pub const ALL: [Self; 5] = [Self::Direct, Self::Im2colGemm, Self::SplitReduce, Self::DownConvert, Self::Tf32];

    pub const fn id(self) -> i64 {
        match self {
            Self::Direct => 0,
            Self::Im2colGemm => 1,
            Self::SplitReduce => 2,
            Self::DownConvert => 3,
            Self::Tf32 => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Im2colGemm => "im2col_gemm",
            Self::SplitReduce => "split_reduce",
            Self::DownConvert => "down_convert",
            Self::Tf32 => "tf32",
        }
    }

    pub const fn notes(self) -> NumericalNotes {
        match self {
            Self::Direct | Self::Im2colGemm => NumericalNotes::empty(),
            Self::SplitReduce => NumericalNotes::NONDETERMINISTIC,
            Self::DownConvert => NumericalNotes::DOWN_CONVERT_INPUTS,
            Self::Tf32 => NumericalNotes::TENSOR_CORE,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.id() == id)
    }

    pub fn config(self) -> EngineConfig {
        EngineConfig::new(self.id(), self.name(), self.notes())
    }
}

/// A compiled CPU plan.
#[derive(Debug, Clone)]
pub struct CpuPlan {
    config: EngineConfig,
    engine: CpuEngine,
    geometry: ConvGeometry,
    data_type: DataType,
    workspace_size: usize,
}

impl CpuPlan {
    pub fn cpu_engine(&self) -> CpuEngine {
        self.engine
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }
}

impl ExecutionPlan for CpuPlan {
    fn engine(&self) -> &EngineConfig {
        &self.config
    }

    fn workspace_size(&self) -> usize {
        self.workspace_size
    }
}

/// Reference runtime on the global `rayon` pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRuntime {
    workspace_limit: usize,
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self { workspace_limit: 256 << 20 }
    }
}

impl CpuRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest workspace a plan may request.
    #[must_use]
    pub const fn with_workspace_limit(mut self, bytes: usize) -> Self {
        self.workspace_limit = bytes;
        self
    }

    pub const fn workspace_limit(&self) -> usize {
        self.workspace_limit
    }

    /// Engines worth trying for `node`, best first.
    fn rank(node: &OperationNode) -> Vec<CpuEngine> {
        use CpuEngine::*;
        let mut ranked = match node.data_type() {
            DataType::Float => vec![Tf32, Im2colGemm, SplitReduce, Direct, DownConvert],
            DataType::Double => vec![Im2colGemm, SplitReduce, Direct, DownConvert],
            DataType::Half => vec![Im2colGemm, SplitReduce, Direct],
            _ => Vec::new(),
        };

        let geometry = ConvGeometry::new(&node.x.shape, &node.w.shape, &node.y.shape, &node.conv);
        if geometry.reduction_len() >= SPLIT_REDUCE_THRESHOLD {
            promote(&mut ranked, SplitReduce);
        }
        if node.min_alignment() < TF32_ALIGNMENT {
            demote(&mut ranked, Tf32);
        }
        ranked
    }
}

fn promote(ranked: &mut Vec<CpuEngine>, engine: CpuEngine) {
    if let Some(i) = ranked.iter().position(|&e| e == engine) {
        let e = ranked.remove(i);
        ranked.insert(0, e);
    }
}

fn demote(ranked: &mut Vec<CpuEngine>, engine: CpuEngine) {
    if let Some(i) = ranked.iter().position(|&e| e == engine) {
        let e = ranked.remove(i);
        ranked.push(e);
    }
}

impl Runtime for CpuRuntime {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn context(&self, device: DeviceId) -> Result<Arc<CpuContext>, ConvError> {
        CPU_CONTEXTS.acquire_or_create(device, |d| Ok(CpuContext::new(d)))
    }

    fn engine_configs(&self, graph: &OperationGraph<CpuContext>, mode: HeuristicMode) -> Vec<EngineConfig> {
        let engines = match mode {
            HeuristicMode::Instant => Self::rank(graph.root()),
            HeuristicMode::Fallback => vec![CpuEngine::Direct],
        };
        log::trace!("cpu heuristics ({mode:?}): {:?}", engines.iter().map(|e| e.name()).collect::<Vec<_>>());
        engines.into_iter().map(CpuEngine::config).collect()
    }
}

impl PlanBackend for CpuRuntime {
    type Context = CpuContext;
    type Plan = CpuPlan;

    fn compile(&self, graph: &OperationGraph<CpuContext>, config: &EngineConfig) -> Result<CpuPlan, EngineCompileError> {
        let fail = |reason: String| EngineCompileError::new(config.engine_id, reason);
        if graph.operations().len() != 1 {
            return Err(fail("fused operation graphs are not supported".into()));
        }
        let engine = CpuEngine::from_id(config.engine_id).ok_or_else(|| fail("unknown engine".into()))?;

        let node = graph.root();
        let data_type = node.data_type();
        let geometry = ConvGeometry::new(&node.x.shape, &node.w.shape, &node.y.shape, &node.conv);

        let workspace_size = match engine {
            CpuEngine::Im2colGemm => {
                if geometry.groups != 1 {
                    return Err(fail(format!("grouped convolution (groups = {})", geometry.groups)));
                }
                let bytes = im2col_workspace_size(&geometry, data_type.size_in_bytes());
                if bytes > self.workspace_limit {
                    return Err(fail(format!(
                        "column matrix needs {bytes} bytes, limit is {}",
                        self.workspace_limit
                    )));
                }
                bytes
            }
            CpuEngine::DownConvert if data_type == DataType::Half => {
                return Err(fail("no narrower type than f16".into()));
            }
            CpuEngine::Tf32 => {
                if data_type != DataType::Float {
                    return Err(fail(format!("tf32 requires f32 operands, got {data_type}")));
                }
                let align = node.min_alignment();
                if align < TF32_ALIGNMENT {
                    return Err(fail(format!("operands are {align}-byte aligned, need {TF32_ALIGNMENT}")));
                }
                0
            }
            _ => 0,
        };

        Ok(CpuPlan { config: config.clone(), engine, geometry, data_type, workspace_size })
    }

    fn execute(&self, graph: &OperationGraph<CpuContext>, plan: &CpuPlan, pack: VariantPack<'_>) -> Result<(), ExecFailure> {
        let node = graph.root();
        let (workspace, mut pointers) = pack.into_parts();
        if workspace.len() < plan.workspace_size {
            return Err(ConvError::Internal(format!(
                "workspace of {} bytes bound for a plan needing {}",
                workspace.len(),
                plan.workspace_size
            ))
            .into());
        }

        let x = bound_read(&mut pointers, node, OperandRole::Input)?;
        let w = bound_read(&mut pointers, node, OperandRole::Weight)?;
        let y = bound_write(&mut pointers, node, OperandRole::Output)?;

        let exec = Exec { plan, node, col: workspace.as_bytes_mut() };
        match plan.data_type {
            DataType::Half => exec.run::<f16>(x, w, y),
            DataType::Float => exec.run::<f32>(x, w, y),
            DataType::Double => exec.run::<f64>(x, w, y),
            other => Err(ConvError::Internal(format!("plan compiled for {other}")).into()),
        }
    }
}

fn check_extent(node: &OperationNode, role: OperandRole, storage: &Storage) -> Result<(), ExecFailure> {
    let needed = node.operand(role).extent();
    if storage.len() < needed {
        return Err(ConvError::Internal(format!(
            "{role:?} buffer holds {} elements, descriptor addresses {needed}",
            storage.len()
        ))
        .into());
    }
    Ok(())
}

fn bound_read<'a>(
    pointers: &mut BTreeMap<i64, DataPtr<'a>>,
    node: &OperationNode,
    role: OperandRole,
) -> Result<&'a Storage, ExecFailure> {
    let storage = take_read(pointers, role.uid())?;
    check_extent(node, role, storage)?;
    Ok(storage)
}

fn bound_write<'a>(
    pointers: &mut BTreeMap<i64, DataPtr<'a>>,
    node: &OperationNode,
    role: OperandRole,
) -> Result<&'a mut Storage, ExecFailure> {
    let storage = take_write(pointers, role.uid())?;
    check_extent(node, role, storage)?;
    Ok(storage)
}

struct Exec<'p> {
    plan: &'p CpuPlan,
    node: &'p OperationNode,
    col: &'p mut [u8],
}

impl Exec<'_> {
    fn run<T: Element>(self, x: &Storage, w: &Storage, y: &mut Storage) -> Result<(), ExecFailure> {
        let engine_id = self.plan.config.engine_id;
        let mismatch = |role: OperandRole, found: DataType| {
            ConvError::Internal(format!("bound {found} {role:?} buffer to a {} plan", T::DATA_TYPE))
        };
        let xs = x.as_slice::<T>().ok_or_else(|| mismatch(OperandRole::Input, x.data_type()))?;
        let ws = w.as_slice::<T>().ok_or_else(|| mismatch(OperandRole::Weight, w.data_type()))?;
        let y_type = y.data_type();
        let ys = y.as_mut_slice::<T>().ok_or_else(|| mismatch(OperandRole::Output, y_type))?;

        let node = self.node;
        let g = &self.plan.geometry;
        let layout = Layout { x: &node.x.strides, w: &node.w.strides, y: &node.y.strides, y_shape: &node.y.shape };
        let blend = Blend { alpha: node.scaling.alpha(), beta: node.scaling.beta() };

        match self.plan.engine {
            CpuEngine::Direct => kernels::direct(g, layout, blend, Precision::Native, xs, ws, ys),
            CpuEngine::DownConvert => kernels::direct(g, layout, blend, Precision::DownConvert, xs, ws, ys),
            CpuEngine::Tf32 => kernels::direct(g, layout, blend, Precision::Tf32, xs, ws, ys),
            CpuEngine::SplitReduce => kernels::split_reduce(g, layout, blend, xs, ws, ys),
            CpuEngine::Im2colGemm => {
                let col = bytemuck::try_cast_slice_mut::<u8, T>(self.col)
                    .map_err(|e| EngineExecError::new(engine_id, format!("unusable workspace: {e}")))?;
                kernels::im2col_gemm(g, layout, blend, xs, ws, col, ys);
            }
        }
        Ok(())
    }
}
