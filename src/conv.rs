//! Convolution entry points.
//!
//! [`convolution`] is what callers use: it picks the runtime from the global
//! [`Backend`] switch. [`convolution_with`] runs the whole selection pipeline
//! on an explicit runtime:
//!
//! 1. reject benchmark mode and malformed arguments,
//! 2. normalize the operand layout and allocate the output,
//! 3. return early if the output has no elements,
//! 4. describe the problem as an operation graph on the caller's context,
//! 5. rank, filter and execute the engine candidates.

use crate::backend::{Backend, get_backend};
use crate::config::ConvOptions;
use crate::descriptor::{OperandRole, OperationNode, data_type_of};
use crate::engine::HeuristicMode;
use crate::error::ConvError;
use crate::filter::{ConvPolicy, filter_engine_configs};
use crate::graph::OperationGraph;
use crate::plan::{Bindings, Selection, execute_first_viable};
use crate::runtime::Runtime;
use crate::runtime::cpu::CpuRuntime;
use crate::shape::{ConvParams, check_conv_args, conv_output_size, use_channels_last};
use crate::tensor::{MemoryFormat, Tensor};
use briny::prelude::*;

/// Forward convolution `weight (*) input` on the globally selected backend.
///
/// # Errors
/// See [`convolution_with`]. A `wgpu` backend that cannot create a device
/// context falls back to the CPU runtime.
pub fn convolution(
    input: &Tensor,
    weight: &Tensor,
    params: &ConvParams,
    options: &ConvOptions,
) -> Result<Tensor, ConvError> {
    match get_backend() {
        Backend::Cpu => convolution_with(&CpuRuntime::default(), input, weight, params, options),
        Backend::Wgpu => wgpu_convolution(input, weight, params, options),
    }
}

#[cfg(feature = "wgpu")]
fn wgpu_convolution(
    input: &Tensor,
    weight: &Tensor,
    params: &ConvParams,
    options: &ConvOptions,
) -> Result<Tensor, ConvError> {
    let runtime = crate::runtime::wgpu::WgpuRuntime::new();
    match convolution_with(&runtime, input, weight, params, options) {
        Err(ConvError::Device(reason)) => {
            log::warn!("wgpu unavailable ({reason}), falling back to cpu");
            convolution_with(&CpuRuntime::default(), input, weight, params, options)
        }
        other => other,
    }
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_convolution(
    input: &Tensor,
    weight: &Tensor,
    params: &ConvParams,
    options: &ConvOptions,
) -> Result<Tensor, ConvError> {
    log::warn!("built without the `wgpu` feature, falling back to cpu");
    convolution_with(&CpuRuntime::default(), input, weight, params, options)
}

/// Forward convolution on `runtime`.
///
/// # Errors
/// - [`ConvError::BenchmarkUnsupported`] if `options.benchmark` is set
/// - [`ConvError::InvalidArgument`] for inconsistent shapes, parameters,
///   element types or devices
/// - [`ConvError::UnsupportedDataType`] for operands other than f16/f32/f64
/// - [`ConvError::Device`] if no execution context can be created
/// - [`ConvError::NoViableEngine`] if no candidate compiles and executes
/// - anything fatal raised by the runtime
pub fn convolution_with<R: Runtime>(
    runtime: &R,
    input: &Tensor,
    weight: &Tensor,
    params: &ConvParams,
    options: &ConvOptions,
) -> Result<Tensor, ConvError> {
    convolution_selection(runtime, input, weight, params, options).map(|(out, _)| out)
}

/// [`convolution_with`], also reporting which engine produced the output.
///
/// The selection is `None` when the output has no elements and nothing ran.
pub fn convolution_selection<R: Runtime>(
    runtime: &R,
    input: &Tensor,
    weight: &Tensor,
    params: &ConvParams,
    options: &ConvOptions,
) -> Result<(Tensor, Option<Selection>), ConvError> {
    if options.benchmark {
        return Err(ConvError::BenchmarkUnsupported);
    }
    params
        .validate()
        .map_err(|_| ConvError::InvalidArgument(format!("malformed convolution parameters {params:?}")))?;
    if input.data_type() != weight.data_type() {
        return Err(ConvError::InvalidArgument(format!(
            "input is {} but weight is {}",
            input.data_type(),
            weight.data_type()
        )));
    }
    if input.device() != weight.device() {
        return Err(ConvError::InvalidArgument(format!(
            "input is on {} but weight is on {}",
            input.device(),
            weight.device()
        )));
    }
    let data_type = data_type_of(input)?;
    check_conv_args(input, weight, params)?;

    let format = if use_channels_last(input, weight) {
        MemoryFormat::ChannelsLast
    } else {
        MemoryFormat::Contiguous
    };
    let out_shape = conv_output_size(input.shape(), weight.shape(), &params.padding, &params.stride, &params.dilation)?;
    let mut output = Tensor::zeros(out_shape, data_type, input.device(), format);
    if output.numel() == 0 {
        return Ok((output, None));
    }
    let input = input.contiguous(format);
    let weight = weight.contiguous(format);

    let node = OperationNode::conv_forward(&input, &output, &weight, params)?;
    let context = runtime.context(input.device())?;
    let graph = OperationGraph::builder().context(context).operation(node).build()?;

    let ranked = runtime.engine_configs(&graph, HeuristicMode::Instant);
    let policy = ConvPolicy::from_options(options, data_type);
    let candidates = filter_engine_configs(&ranked, &policy);
    log::trace!(
        "{}: {} of {} heuristic candidates pass {policy:?}",
        runtime.name(),
        candidates.len(),
        ranked.len()
    );

    let mut bindings = Bindings::new()
        .read(OperandRole::Input, input.storage())
        .read(OperandRole::Weight, weight.storage())
        .write(OperandRole::Output, output.storage_mut());
    let selection = execute_first_viable(runtime, &graph, &candidates, &mut bindings)?;
    drop(bindings);

    Ok((output, Some(selection)))
}
