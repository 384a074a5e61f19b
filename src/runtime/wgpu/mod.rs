//! GPU runtime using WGPU.
//!
//! Convolutions run as a WGSL compute shader, one invocation per output
//! element. Each `(device, thread)` pair gets its own `wgpu::Device` and
//! queue from the shared context pool; pipelines are built per plan so the
//! workgroup size can be checked against the device limits at compile time.
//!
//! Only 2-D `f32` convolutions are offered. For anything else the heuristics
//! return no candidates.

use crate::context::ContextPool;
use crate::descriptor::{OperandRole, OperationNode};
use crate::dtype::DataType;
use crate::engine::{EngineConfig, HeuristicMode, NumericalNotes};
use crate::error::{ConvError, EngineCompileError, EngineExecError, ExecFailure};
use crate::graph::OperationGraph;
use crate::plan::{ExecutionPlan, PlanBackend, VariantPack, take_read, take_write};
use crate::runtime::Runtime;
use crate::tensor::{DeviceId, Storage};
use briny::prelude::*;
use std::sync::Arc;
use wgpu::util::DeviceExt;

const CONV2D: &str = include_str!("shaders/conv2d.wgsl");

lazy_static::lazy_static! {
    static ref GPU_CONTEXTS: ContextPool<GpuContext> = ContextPool::new();
}

/// Failure to bring up a device.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("no adapter at index {0}")]
    NoSuchAdapter(usize),
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

impl From<GpuError> for ConvError {
    fn from(e: GpuError) -> Self {
        ConvError::Device(e.to_string())
    }
}

/// Failure while building or running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GpuFailure {
    #[error("shader failed validation: {0}")]
    Validation(ValidationError),
    #[error("{0}")]
    Wgpu(#[from] wgpu::Error),
    #[error("{0}")]
    Message(String),
}

impl From<ValidationError> for GpuFailure {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<&str> for GpuFailure {
    fn from(msg: &str) -> Self {
        Self::Message(msg.to_string())
    }
}

impl From<String> for GpuFailure {
    fn from(msg: String) -> Self {
        Self::Message(msg)
    }
}

/// The WGPU device and queue of one execution context.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub ordinal: DeviceId,
}

impl core::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GpuContext").field("ordinal", &self.ordinal).finish_non_exhaustive()
    }
}

impl GpuContext {
    /// Opens adapter `device` (index into the enumerated adapters; 0 is the
    /// default adapter) and creates a device and queue on it.
    pub fn new(device: DeviceId) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = if device.0 == 0 {
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?
        } else {
            instance
                .enumerate_adapters(wgpu::Backends::all())
                .into_iter()
                .nth(device.0)
                .ok_or(GpuError::NoSuchAdapter(device.0))?
        };
        log::debug!("using adapter {:?} for {device}", adapter.get_info().name);

        let (dev, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_conv"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        Ok(Self { device: dev, queue, ordinal: device })
    }
}

/// WGSL source checked before it reaches the driver.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("{{") || src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }
        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Conv shader specialized for `workgroup_size`.
pub fn conv2d_source(workgroup_size: u32) -> String {
    CONV2D.replace("{{WORKGROUP_SIZE}}", &workgroup_size.to_string())
}

/// Validates `source` and hands it to the device.
pub fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// The WGSL engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WgslEngine {
    Direct64,
    Direct256,
}

impl WgslEngine {
    pub const ALL: [Self; 2] = [Self::Direct64, Self::Direct256];

    pub const fn id(self) -> i64 {
        match self {
            Self::Direct64 => 100,
            Self::Direct256 => 101,
        }
    }

    pub const fn workgroup_size(self) -> u32 {
        match self {
            Self::Direct64 => 64,
            Self::Direct256 => 256,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.id() == id)
    }

    pub fn config(self) -> EngineConfig {
        let name = match self {
            Self::Direct64 => "wgsl_direct_64",
            Self::Direct256 => "wgsl_direct_256",
        };
        EngineConfig::new(self.id(), name, NumericalNotes::empty())
            .knob("workgroup_size", i64::from(self.workgroup_size()))
    }
}

/// Uniform block of the conv shader, field for field.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvUniform {
    dims: [u32; 16],
    x_strides: [u32; 4],
    w_strides: [u32; 4],
    y_strides: [u32; 4],
    alpha: f32,
    beta: f32,
    reserved: [u32; 2],
}

fn narrow(v: usize, what: &str) -> Result<u32, String> {
    u32::try_from(v).map_err(|_| format!("{what} ({v}) does not fit in u32"))
}

fn strides4(strides: &[usize], what: &str) -> Result<[u32; 4], String> {
    let mut out = [0; 4];
    for (o, &s) in out.iter_mut().zip(strides) {
        *o = narrow(s, what)?;
    }
    Ok(out)
}

impl ConvUniform {
    #[allow(clippy::cast_possible_truncation)]
    fn new(node: &OperationNode) -> Result<Self, String> {
        let (x, w, y, conv) = (&node.x.shape, &node.w.shape, &node.y.shape, &node.conv);
        let raw = [
            x[0], x[1], x[2], x[3],
            w[0], w[2], w[3], y[2],
            y[3], conv.stride[0], conv.stride[1], conv.pre_padding[0],
            conv.pre_padding[1], conv.dilation[0], conv.dilation[1], conv.groups,
        ];
        let mut dims = [0; 16];
        for (d, &v) in dims.iter_mut().zip(&raw) {
            *d = narrow(v, "extent")?;
        }
        narrow(node.y.shape.iter().product(), "output size")?;
        for desc in node.operands() {
            narrow(desc.extent(), "operand extent")?;
        }
        Ok(Self {
            dims,
            x_strides: strides4(&node.x.strides, "input stride")?,
            w_strides: strides4(&node.w.strides, "weight stride")?,
            y_strides: strides4(&node.y.strides, "output stride")?,
            alpha: node.scaling.alpha() as f32,
            beta: node.scaling.beta() as f32,
            reserved: [0; 2],
        })
    }
}

/// A compiled conv pipeline.
pub struct WgpuPlan {
    config: EngineConfig,
    workgroup_size: u32,
    uniform: ConvUniform,
    outputs: u32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl core::fmt::Debug for WgpuPlan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WgpuPlan").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ExecutionPlan for WgpuPlan {
    fn engine(&self) -> &EngineConfig {
        &self.config
    }

    fn workspace_size(&self) -> usize {
        0
    }
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer { ty, has_dynamic_offset: false, min_binding_size: None },
        count: None,
    }
}

fn build_pipeline(
    device: &wgpu::Device,
    workgroup_size: u32,
) -> Result<(wgpu::BindGroupLayout, wgpu::ComputePipeline), GpuFailure> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = load_shader(device, "conv2d", &conv2d_source(workgroup_size));
    let built = module.map(|module| {
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("conv2d_bgl"),
            entries: &[
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                buffer_entry(3, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("conv2d_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("conv2d_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        (layout, pipeline)
    });

    // the scope must be popped even when validation failed
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(err.into());
    }
    built
}

/// Runtime backed by WGPU compute shaders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WgpuRuntime;

impl WgpuRuntime {
    pub fn new() -> Self {
        Self
    }

    fn supports(node: &OperationNode) -> bool {
        node.data_type() == DataType::Float && node.conv.spatial_dims == 2
    }
}

impl Runtime for WgpuRuntime {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn context(&self, device: DeviceId) -> Result<Arc<GpuContext>, ConvError> {
        GPU_CONTEXTS.acquire_or_create(device, |d| GpuContext::new(d).map_err(ConvError::from))
    }

    fn engine_configs(&self, graph: &OperationGraph<GpuContext>, mode: HeuristicMode) -> Vec<EngineConfig> {
        if !Self::supports(graph.root()) {
            log::trace!("wgpu heuristics: no engine for this problem");
            return Vec::new();
        }
        let engines = match mode {
            HeuristicMode::Instant => vec![WgslEngine::Direct256, WgslEngine::Direct64],
            HeuristicMode::Fallback => vec![WgslEngine::Direct64],
        };
        engines.into_iter().map(WgslEngine::config).collect()
    }
}

impl PlanBackend for WgpuRuntime {
    type Context = GpuContext;
    type Plan = WgpuPlan;

    fn compile(&self, graph: &OperationGraph<GpuContext>, config: &EngineConfig) -> Result<WgpuPlan, EngineCompileError> {
        let fail = |reason: String| EngineCompileError::new(config.engine_id, reason);
        if graph.operations().len() != 1 {
            return Err(fail("fused operation graphs are not supported".into()));
        }
        let engine = WgslEngine::from_id(config.engine_id).ok_or_else(|| fail("unknown engine".into()))?;
        let node = graph.root();
        if !Self::supports(node) {
            return Err(fail(format!("only 2-d f32 convolutions, got {}", node.data_type())));
        }

        let device = &graph.context().device;
        let workgroup_size = engine.workgroup_size();
        let limit = device.limits().max_compute_invocations_per_workgroup;
        if workgroup_size > limit {
            return Err(fail(format!("workgroup size {workgroup_size} exceeds device limit {limit}")));
        }

        let uniform = ConvUniform::new(node).map_err(fail)?;
        let outputs = uniform.dims[0] * uniform.dims[4] * uniform.dims[7] * uniform.dims[8];
        let (layout, pipeline) = build_pipeline(device, workgroup_size).map_err(|e| fail(e.to_string()))?;

        Ok(WgpuPlan { config: config.clone(), workgroup_size, uniform, outputs, layout, pipeline })
    }

    fn execute(&self, graph: &OperationGraph<GpuContext>, plan: &WgpuPlan, pack: VariantPack<'_>) -> Result<(), ExecFailure> {
        let (_, mut pointers) = pack.into_parts();
        let x = take_read(&mut pointers, OperandRole::Input.uid())?;
        let w = take_read(&mut pointers, OperandRole::Weight.uid())?;
        let y = take_write(&mut pointers, OperandRole::Output.uid())?;
        let node = graph.root();
        for (role, len) in [(OperandRole::Input, x.len()), (OperandRole::Weight, w.len()), (OperandRole::Output, y.len())] {
            let needed = node.operand(role).extent();
            if len < needed {
                return Err(ConvError::Internal(format!("{role:?} buffer holds {len} elements, descriptor addresses {needed}")).into());
            }
        }

        let engine_id = plan.config.engine_id;
        let mismatch =
            |role: OperandRole, found: DataType| ConvError::Internal(format!("bound {found} {role:?} buffer to an f32 plan"));
        let as_f32 = |role: OperandRole, s: &Storage| -> Result<Vec<f32>, ConvError> {
            s.as_slice::<f32>().map(<[f32]>::to_vec).ok_or_else(|| mismatch(role, s.data_type()))
        };
        let (xs, ws) = (as_f32(OperandRole::Input, x)?, as_f32(OperandRole::Weight, w)?);
        let y_type = y.data_type();
        let ys = y.as_mut_slice::<f32>().ok_or_else(|| mismatch(OperandRole::Output, y_type))?;

        let ctx = graph.context();
        run_conv2d(ctx, plan, &xs, &ws, ys).map_err(|e| EngineExecError::new(engine_id, e.to_string()).into())
    }
}

fn run_conv2d(ctx: &GpuContext, plan: &WgpuPlan, x: &[f32], w: &[f32], y: &mut [f32]) -> Result<(), GpuFailure> {
    let (device, queue) = (&ctx.device, &ctx.queue);

    let groups = plan.outputs.div_ceil(plan.workgroup_size);
    let max_dim = device.limits().max_compute_workgroups_per_dimension;
    let gx = groups.min(max_dim).max(1);
    let gy = groups.div_ceil(gx);
    if gy > max_dim {
        return Err(format!("{} outputs need more than {max_dim}x{max_dim} workgroups", plan.outputs).into());
    }

    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("conv2d_params"),
        contents: bytemuck::bytes_of(&plan.uniform),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let x_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("x"),
        contents: bytemuck::cast_slice(x),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let w_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("w"),
        contents: bytemuck::cast_slice(w),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let y_bytes = (y.len() * size_of::<f32>()) as u64;
    let y_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("y"),
        contents: bytemuck::cast_slice(y),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("conv2d_bind_group"),
        layout: &plan.layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: params_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: x_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: w_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: y_buffer.as_entire_binding() },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("conv2d_encoder") });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("conv2d_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&plan.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(gx, gy, 1);
    }

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size: y_bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    encoder.copy_buffer_to_buffer(&y_buffer, 0, &staging, 0, y_bytes);
    queue.submit(Some(encoder.finish()));

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(err.into());
    }

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::PollType::Wait).map_err(|e| GpuFailure::Message(e.to_string()))?;
    rx.recv()
        .map_err(|_| GpuFailure::from("staging buffer was never mapped"))?
        .map_err(|e| GpuFailure::Message(e.to_string()))?;

    {
        let data = slice.get_mapped_range();
        let out: &[f32] = bytemuck::try_cast_slice(&data).map_err(|e| GpuFailure::Message(e.to_string()))?;
        y.copy_from_slice(out);
    }
    staging.unmap();
    Ok(())
}
