//! Operand and operation descriptors.
//!
//! A descriptor is the runtime-facing summary of one operand or one
//! operation: extents, element strides, element type, a stable operand uid
//! and the alignment hint heuristics use to rank engines. Descriptors are
//! built once per call and never outlive it.

use crate::dtype::DataType;
use crate::error::ConvError;
use crate::shape::ConvParams;
use crate::tensor::Tensor;

/// Position of an operand in a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandRole {
    Input,
    Output,
    Weight,
}

impl OperandRole {
    pub const ALL: [Self; 3] = [Self::Input, Self::Output, Self::Weight];

    /// Stable identifier the operand is bound under in a variant pack.
    pub const fn uid(self) -> i64 {
        match self {
            Self::Input => b'x' as i64,
            Self::Output => b'y' as i64,
            Self::Weight => b'w' as i64,
        }
    }

    pub fn from_uid(uid: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uid() == uid)
    }
}

/// Largest power of two, capped at 16, dividing `address` (in bytes).
pub const fn alignment_of(address: usize) -> usize {
    if address == 0 {
        return 16;
    }
    let align = 1usize << address.trailing_zeros();
    if align > 16 { 16 } else { align }
}

/// Rejects element types outside the supported set.
pub fn data_type_of(tensor: &Tensor) -> Result<DataType, ConvError> {
    let dt = tensor.data_type();
    if dt.is_supported() { Ok(dt) } else { Err(ConvError::UnsupportedDataType(dt)) }
}

/// Runtime-facing summary of one operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandDescriptor {
    pub role: OperandRole,
    pub uid: i64,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    /// Advisory byte alignment of the base address.
    pub alignment: usize,
    pub data_type: DataType,
}

impl OperandDescriptor {
    pub fn from_tensor(tensor: &Tensor, role: OperandRole) -> Result<Self, ConvError> {
        Ok(Self {
            role,
            uid: role.uid(),
            shape: tensor.shape().to_vec(),
            strides: tensor.strides().to_vec(),
            alignment: alignment_of(tensor.address()),
            data_type: data_type_of(tensor)?,
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// One past the largest element offset the strides reach.
    pub fn extent(&self) -> usize {
        if self.shape.contains(&0) {
            return 0;
        }
        self.shape.iter().zip(&self.strides).map(|(d, s)| (d - 1) * s).sum::<usize>() + 1
    }
}

/// How the kernel is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathMode {
    /// Kernel is not flipped (the deep-learning "convolution").
    CrossCorrelation,
}

/// Algorithmic parameters of a convolution node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub compute_type: DataType,
    pub math_mode: MathMode,
    pub spatial_dims: usize,
    pub stride: Vec<usize>,
    pub pre_padding: Vec<usize>,
    pub post_padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub groups: usize,
}

impl ConvDescriptor {
    /// Symmetric padding descriptor for `params`.
    pub fn new(compute_type: DataType, params: &ConvParams) -> Self {
        Self {
            compute_type,
            math_mode: MathMode::CrossCorrelation,
            spatial_dims: params.spatial_dims(),
            stride: params.stride.clone(),
            pre_padding: params.padding.clone(),
            post_padding: params.padding.clone(),
            dilation: params.dilation.clone(),
            groups: params.groups,
        }
    }
}

/// Blend coefficients `y = alpha * op(x, w) + beta * y`, held at the
/// precision the runtime expects for the compute type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scaling {
    Float { alpha: f32, beta: f32 },
    Double { alpha: f64, beta: f64 },
}

impl Scaling {
    /// `alpha = 1, beta = 0`: overwrite the output.
    pub const fn overwrite(compute_type: DataType) -> Self {
        match compute_type {
            DataType::Double => Self::Double { alpha: 1.0, beta: 0.0 },
            _ => Self::Float { alpha: 1.0, beta: 0.0 },
        }
    }

    pub fn alpha(self) -> f64 {
        match self {
            Self::Float { alpha, .. } => f64::from(alpha),
            Self::Double { alpha, .. } => alpha,
        }
    }

    pub fn beta(self) -> f64 {
        match self {
            Self::Float { beta, .. } => f64::from(beta),
            Self::Double { beta, .. } => beta,
        }
    }
}

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    ConvolutionForward,
}

/// One operation of an operation graph.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub kind: OperationKind,
    pub x: OperandDescriptor,
    pub y: OperandDescriptor,
    pub w: OperandDescriptor,
    pub conv: ConvDescriptor,
    pub scaling: Scaling,
}

impl OperationNode {
    /// `output = conv(input, weight)` with `alpha = 1, beta = 0`.
    ///
    /// Operands must already be normalized to their final layout; their
    /// addresses feed the alignment hints.
    pub fn conv_forward(
        input: &Tensor,
        output: &Tensor,
        weight: &Tensor,
        params: &ConvParams,
    ) -> Result<Self, ConvError> {
        let x = OperandDescriptor::from_tensor(input, OperandRole::Input)?;
        let y = OperandDescriptor::from_tensor(output, OperandRole::Output)?;
        let w = OperandDescriptor::from_tensor(weight, OperandRole::Weight)?;
        let conv = ConvDescriptor::new(x.data_type, params);
        Ok(Self {
            kind: OperationKind::ConvolutionForward,
            scaling: Scaling::overwrite(x.data_type),
            x,
            y,
            w,
            conv,
        })
    }

    pub fn operands(&self) -> [&OperandDescriptor; 3] {
        [&self.x, &self.y, &self.w]
    }

    pub fn operand(&self, role: OperandRole) -> &OperandDescriptor {
        match role {
            OperandRole::Input => &self.x,
            OperandRole::Output => &self.y,
            OperandRole::Weight => &self.w,
        }
    }

    /// Smallest alignment among the operands.
    pub fn min_alignment(&self) -> usize {
        self.operands().iter().map(|d| d.alignment).min().unwrap_or(1)
    }

    pub fn data_type(&self) -> DataType {
        self.conv.compute_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_capped_power_of_two() {
        assert_eq!(alignment_of(0x1000), 16);
        assert_eq!(alignment_of(0x1008), 8);
        assert_eq!(alignment_of(0x1004), 4);
        assert_eq!(alignment_of(0x1002), 2);
        assert_eq!(alignment_of(0x1001), 1);
        assert_eq!(alignment_of(48), 16);
    }

    #[test]
    fn uids_round_trip_and_are_distinct() {
        for role in OperandRole::ALL {
            assert_eq!(OperandRole::from_uid(role.uid()), Some(role));
        }
        assert_eq!(OperandRole::Input.uid(), i64::from(b'x'));
        assert_eq!(OperandRole::from_uid(0), None);
    }

    #[test]
    fn unsupported_operand_type_is_rejected() {
        let t = Tensor::from_vec(vec![1, 1, 2], vec![1i32, 2]);
        let err = OperandDescriptor::from_tensor(&t, OperandRole::Input).unwrap_err();
        assert!(matches!(err, ConvError::UnsupportedDataType(DataType::Int32)));
    }

    #[test]
    fn double_operands_get_double_scaling() {
        let x = Tensor::from_vec(vec![1, 1, 3], vec![1.0f64, 2.0, 3.0]);
        let w = Tensor::from_vec(vec![1, 1, 2], vec![1.0f64, 1.0]);
        let y = Tensor::from_vec(vec![1, 1, 2], vec![0.0f64; 2]);
        let node = OperationNode::conv_forward(&x, &y, &w, &ConvParams::new(1)).unwrap();
        assert_eq!(node.scaling, Scaling::Double { alpha: 1.0, beta: 0.0 });
        assert_eq!(node.y.uid, OperandRole::Output.uid());
        assert_eq!(node.w.extent(), 2);
    }
}
