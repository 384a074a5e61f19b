//! Convolution parameters and shape bookkeeping.
//!
//! Everything here is plain data marshaling: validating the argument
//! combination, computing the output extents and choosing the memory layout
//! the operands are normalized to.

use crate::descriptor::ConvDescriptor;
use crate::error::ConvError;
use crate::tensor::{MemoryFormat, Tensor};
use briny::prelude::*;

/// Algorithmic parameters of an N-d convolution, one entry per spatial dim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub groups: usize,
}

impl ConvParams {
    /// Unit stride and dilation, no padding, one group.
    pub fn new(spatial_dims: usize) -> Self {
        Self {
            stride: vec![1; spatial_dims],
            padding: vec![0; spatial_dims],
            dilation: vec![1; spatial_dims],
            groups: 1,
        }
    }

    #[must_use]
    pub fn stride(mut self, stride: impl Into<Vec<usize>>) -> Self {
        self.stride = stride.into();
        self
    }

    #[must_use]
    pub fn padding(mut self, padding: impl Into<Vec<usize>>) -> Self {
        self.padding = padding.into();
        self
    }

    #[must_use]
    pub fn dilation(mut self, dilation: impl Into<Vec<usize>>) -> Self {
        self.dilation = dilation.into();
        self
    }

    #[must_use]
    pub const fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn spatial_dims(&self) -> usize {
        self.stride.len()
    }
}

impl Validate for ConvParams {
    fn validate(&self) -> Result<(), ValidationError> {
        let n = self.stride.len();
        if n == 0 || self.padding.len() != n || self.dilation.len() != n {
            return Err(ValidationError);
        }
        if self.groups == 0 {
            return Err(ValidationError);
        }
        if self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Output extents `[N, C_out, out_0, ...]` of a convolution.
///
/// `out = floor((in + 2·pad − dilation·(kernel − 1) − 1) / stride) + 1`
pub fn conv_output_size(
    input: &[usize],
    weight: &[usize],
    padding: &[usize],
    stride: &[usize],
    dilation: &[usize],
) -> Result<Vec<usize>, ConvError> {
    let spatial = input.len().saturating_sub(2);
    if input.len() < 3 || weight.len() != input.len() {
        return Err(ConvError::InvalidArgument(format!(
            "cannot convolve input {input:?} with weight {weight:?}"
        )));
    }
    if padding.len() != spatial || stride.len() != spatial || dilation.len() != spatial {
        return Err(ConvError::InvalidArgument(format!(
            "expected {spatial} padding/stride/dilation entries"
        )));
    }

    let mut out = Vec::with_capacity(input.len());
    out.push(input[0]);
    out.push(weight[0]);
    for d in 0..spatial {
        let overflow = || ConvError::InvalidArgument(format!("convolution extents overflow in spatial dim {d}"));
        let span = dilation[d]
            .checked_mul(weight[d + 2].saturating_sub(1))
            .and_then(|s| s.checked_add(1))
            .ok_or_else(overflow)?;
        let padded = padding[d]
            .checked_mul(2)
            .and_then(|p| p.checked_add(input[d + 2]))
            .ok_or_else(overflow)?;
        if weight[d + 2] == 0 || padded < span {
            return Err(ConvError::InvalidArgument(format!(
                "kernel extent {span} exceeds padded input extent {padded} in spatial dim {d}"
            )));
        }
        out.push((padded - span) / stride[d] + 1);
    }
    Ok(out)
}

/// Checks that `input`, `weight` and `params` describe one convolution.
pub fn check_conv_args(input: &Tensor, weight: &Tensor, params: &ConvParams) -> Result<(), ConvError> {
    let (xs, ws) = (input.shape(), weight.shape());
    if xs.len() < 3 {
        return Err(ConvError::InvalidArgument(format!(
            "expected input of rank 3 or more, got {xs:?}"
        )));
    }
    if ws.len() != xs.len() {
        return Err(ConvError::InvalidArgument(format!(
            "weight rank {} does not match input rank {}",
            ws.len(),
            xs.len()
        )));
    }
    if params.spatial_dims() != xs.len() - 2 {
        return Err(ConvError::InvalidArgument(format!(
            "{} spatial parameters for a {}-d convolution",
            params.spatial_dims(),
            xs.len() - 2
        )));
    }
    if ws[1].checked_mul(params.groups) != Some(xs[1]) {
        return Err(ConvError::InvalidArgument(format!(
            "input has {} channels, weight expects {} x {} groups",
            xs[1], ws[1], params.groups
        )));
    }
    if ws[0] % params.groups != 0 {
        return Err(ConvError::InvalidArgument(format!(
            "{} output channels are not divisible into {} groups",
            ws[0], params.groups
        )));
    }
    Ok(())
}

/// Whether the operands should be normalized to channels-last.
pub fn use_channels_last(input: &Tensor, weight: &Tensor) -> bool {
    let rank = input.dim();
    if rank != 4 && rank != 5 {
        return false;
    }
    input.suggest_memory_format() == MemoryFormat::ChannelsLast
        || weight.suggest_memory_format() == MemoryFormat::ChannelsLast
}

/// Problem extents an engine works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    pub input: Vec<usize>,
    pub kernel: Vec<usize>,
    pub output: Vec<usize>,
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
}

impl ConvGeometry {
    /// Geometry of `x (*) w -> y` under `conv`.
    pub fn new(x: &[usize], w: &[usize], y: &[usize], conv: &ConvDescriptor) -> Self {
        Self {
            batch: x[0],
            in_channels: x[1],
            out_channels: w[0],
            groups: conv.groups,
            input: x[2..].to_vec(),
            kernel: w[2..].to_vec(),
            output: y[2..].to_vec(),
            stride: conv.stride.clone(),
            padding: conv.pre_padding.clone(),
            dilation: conv.dilation.clone(),
        }
    }

    pub fn spatial_rank(&self) -> usize {
        self.input.len()
    }

    pub fn in_channels_per_group(&self) -> usize {
        self.in_channels / self.groups.max(1)
    }

    pub fn out_channels_per_group(&self) -> usize {
        self.out_channels / self.groups.max(1)
    }

    pub fn kernel_len(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn output_spatial_len(&self) -> usize {
        self.output.iter().product()
    }

    /// Number of products summed into one output element.
    pub fn reduction_len(&self) -> usize {
        self.in_channels_per_group() * self.kernel_len()
    }

    pub fn output_numel(&self) -> usize {
        self.batch * self.out_channels * self.output_spatial_len()
    }

    /// Every kernel position in row-major order.
    pub fn kernel_points(&self) -> Vec<Vec<usize>> {
        let mut points = Vec::with_capacity(self.kernel_len());
        let mut index = vec![0usize; self.kernel.len()];
        for _ in 0..self.kernel_len() {
            points.push(index.clone());
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.kernel[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        points
    }

    /// Splits a spatial linear output index into per-dim coordinates.
    pub fn unravel_output(&self, mut linear: usize, out: &mut [usize]) {
        for d in (0..self.output.len()).rev() {
            out[d] = linear % self.output[d];
            linear /= self.output[d];
        }
    }

    /// Input coordinate read by output position `o` at kernel offset `k` in
    /// dim `d`, or `None` when it falls into padding.
    ///
    /// `o * stride + k * dilation` stays below the padded extent that
    /// [`conv_output_size`] already checked.
    #[inline]
    pub fn input_coord(&self, d: usize, o: usize, k: usize) -> Option<usize> {
        let pos = (o * self.stride[d] + k * self.dilation[d]).checked_sub(self.padding[d])?;
        (pos < self.input[d]).then_some(pos)
    }
}
