//! Dense strided tensors.
//!
//! # Core Tensor Utilities
//!
//! This module defines the tensor representation the convolution path
//! consumes and produces. It is deliberately small: a shape, a stride per
//! dimension, a typed flat storage buffer and the logical device the buffer
//! belongs to.
//!
//! It supports:
//! - Construction from a flat `Vec` in row-major order, or with explicit strides
//! - The two memory layouts convolution engines care about (row-major and
//!   channels-last) and relayout between them
//! - Logical element reads for verification
//!
//! ## Design Highlights
//! - Storage is typed per [`DataType`] so unsupported element types can be
//!   represented and rejected explicitly
//! - Strides are element strides, never byte strides
//! - `contiguous` always produces the canonical strides for the requested
//!   layout, including size-1 dimensions
//!
//! ## Example
//!
//! ```rust
//! use briny_conv::tensor::{MemoryFormat, Tensor};
//! let t = Tensor::from_vec(vec![1, 2, 1, 2], vec![1.0f32, 2.0, 3.0, 4.0]);
//! let cl = t.contiguous(MemoryFormat::ChannelsLast);
//! assert_eq!(cl.strides(), &[4, 1, 4, 2]);
//! assert_eq!(cl.to_vec_f64(), t.to_vec_f64());
//! ```

use crate::dtype::{DataType, Element};
use crate::error::ConvError;
use half::{bf16, f16};

/// Logical device a tensor's storage lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub usize);

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Physical ordering of a tensor's dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryFormat {
    /// Row-major (`NCHW`, `NCDHW`, ...).
    #[default]
    Contiguous,
    /// Channels innermost (`NHWC`, `NDHWC`). Only meaningful for rank 4 and 5;
    /// other ranks fall back to row-major.
    ChannelsLast,
}

/// Flat typed element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Half(Vec<f16>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    BFloat16(Vec<bf16>),
    Int32(Vec<i32>),
    UInt8(Vec<u8>),
}

impl Storage {
    /// Zero-filled storage of `len` elements.
    pub fn zeros(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::Half => Self::Half(vec![f16::ZERO; len]),
            DataType::Float => Self::Float(vec![0.0; len]),
            DataType::Double => Self::Double(vec![0.0; len]),
            DataType::BFloat16 => Self::BFloat16(vec![bf16::ZERO; len]),
            DataType::Int32 => Self::Int32(vec![0; len]),
            DataType::UInt8 => Self::UInt8(vec![0; len]),
        }
    }

    /// Element type of the buffer.
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Half(_) => DataType::Half,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::BFloat16(_) => DataType::BFloat16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt8(_) => DataType::UInt8,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Half(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::BFloat16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::UInt8(v) => v.len(),
        }
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base address of the buffer.
    pub fn address(&self) -> usize {
        match self {
            Self::Half(v) => v.as_ptr() as usize,
            Self::Float(v) => v.as_ptr() as usize,
            Self::Double(v) => v.as_ptr() as usize,
            Self::BFloat16(v) => v.as_ptr() as usize,
            Self::Int32(v) => v.as_ptr() as usize,
            Self::UInt8(v) => v.as_ptr() as usize,
        }
    }

    /// Typed view, or `None` when `T` does not match the buffer.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        if T::DATA_TYPE != self.data_type() {
            return None;
        }
        match self {
            Self::Half(v) => bytemuck::try_cast_slice(v).ok(),
            Self::Float(v) => bytemuck::try_cast_slice(v).ok(),
            Self::Double(v) => bytemuck::try_cast_slice(v).ok(),
            _ => None,
        }
    }

    /// Typed mutable view, or `None` when `T` does not match the buffer.
    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        if T::DATA_TYPE != self.data_type() {
            return None;
        }
        match self {
            Self::Half(v) => bytemuck::try_cast_slice_mut(v).ok(),
            Self::Float(v) => bytemuck::try_cast_slice_mut(v).ok(),
            Self::Double(v) => bytemuck::try_cast_slice_mut(v).ok(),
            _ => None,
        }
    }

    /// Reads one element widened to `f64`.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            Self::Half(v) => v.get(i).map(|x| x.to_f64()),
            Self::Float(v) => v.get(i).map(|&x| f64::from(x)),
            Self::Double(v) => v.get(i).copied(),
            Self::BFloat16(v) => v.get(i).map(|x| x.to_f64()),
            Self::Int32(v) => v.get(i).map(|&x| f64::from(x)),
            Self::UInt8(v) => v.get(i).map(|&x| f64::from(x)),
        }
    }
}

macro_rules! impl_from_vec {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Storage {
                fn from(v: Vec<$ty>) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_vec!(
    f16 => Half,
    f32 => Float,
    f64 => Double,
    bf16 => BFloat16,
    i32 => Int32,
    u8 => UInt8,
);

/// Row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut running = 1;
    for d in (0..shape.len()).rev() {
        strides[d] = running;
        running *= shape[d].max(1);
    }
    strides
}

/// Canonical strides of `shape` in `format`.
pub fn strides_for(shape: &[usize], format: MemoryFormat) -> Vec<usize> {
    let rank = shape.len();
    if format == MemoryFormat::Contiguous || !(rank == 4 || rank == 5) {
        return contiguous_strides(shape);
    }
    let mut strides = vec![0; rank];
    strides[1] = 1;
    let mut running = shape[1].max(1);
    for d in (2..rank).rev() {
        strides[d] = running;
        running *= shape[d].max(1);
    }
    strides[0] = running;
    strides
}

/// Physical offset of a logical index.
pub fn offset_of(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Calls `f(logical_linear, physical_offset)` for every element in row-major
/// logical order.
pub(crate) fn for_each_offset(shape: &[usize], strides: &[usize], mut f: impl FnMut(usize, usize)) {
    let numel: usize = shape.iter().product();
    if numel == 0 {
        return;
    }
    let mut index = vec![0usize; shape.len()];
    let mut offset = 0usize;
    for linear in 0..numel {
        f(linear, offset);
        for d in (0..shape.len()).rev() {
            index[d] += 1;
            offset += strides[d];
            if index[d] < shape[d] {
                break;
            }
            offset -= strides[d] * shape[d];
            index[d] = 0;
        }
    }
}

fn gather<T: Copy + Default>(src: &[T], shape: &[usize], src_strides: &[usize], dst_strides: &[usize]) -> Vec<T> {
    let numel: usize = shape.iter().product();
    let mut dst = vec![T::default(); numel];
    let mut index = vec![0usize; shape.len()];
    for _ in 0..numel {
        dst[offset_of(&index, dst_strides)] = src[offset_of(&index, src_strides)];
        for d in (0..shape.len()).rev() {
            index[d] += 1;
            if index[d] < shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    dst
}

/// N-dimensional strided tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage: Storage,
    device: DeviceId,
}

impl Tensor {
    /// Wraps row-major `storage`.
    ///
    /// # Panics
    /// Panics if the number of elements does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, storage: Storage) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            storage.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            storage.len()
        );
        let strides = contiguous_strides(&shape);
        Self { shape, strides, storage, device: DeviceId::default() }
    }

    /// Wraps a row-major `Vec`.
    ///
    /// # Panics
    /// Panics if the number of elements does not match the shape product.
    pub fn from_vec<T>(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self
    where
        Storage: From<Vec<T>>,
    {
        Self::new(shape, Storage::from(data))
    }

    /// Wraps `storage` laid out with explicit element `strides`.
    pub fn with_strides(
        shape: impl Into<Vec<usize>>,
        strides: impl Into<Vec<usize>>,
        storage: Storage,
    ) -> Result<Self, ConvError> {
        let shape = shape.into();
        let strides = strides.into();
        if shape.len() != strides.len() {
            return Err(ConvError::InvalidArgument(format!(
                "shape {shape:?} and strides {strides:?} differ in rank"
            )));
        }
        if shape.iter().all(|&d| d > 0) {
            let last: usize = shape.iter().zip(&strides).map(|(d, s)| (d - 1) * s).sum();
            if last >= storage.len() {
                return Err(ConvError::InvalidArgument(format!(
                    "strides {strides:?} address element {last} of a {}-element storage",
                    storage.len()
                )));
            }
        }
        Ok(Self { shape, strides, storage, device: DeviceId::default() })
    }

    /// Zero-filled tensor in the given layout.
    pub fn zeros(shape: impl Into<Vec<usize>>, data_type: DataType, device: DeviceId, format: MemoryFormat) -> Self {
        let shape = shape.into();
        let strides = strides_for(&shape, format);
        let storage = Storage::zeros(data_type, shape.iter().product());
        Self { shape, strides, storage, device }
    }

    /// Moves the tensor to another logical device.
    #[must_use]
    pub fn on_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn data_type(&self) -> DataType {
        self.storage.data_type()
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Base address of the underlying storage.
    pub fn address(&self) -> usize {
        self.storage.address()
    }

    /// Whether the strides are exactly the canonical strides of `format`.
    pub fn is_contiguous(&self, format: MemoryFormat) -> bool {
        self.strides == strides_for(&self.shape, format)
    }

    /// The layout the strides already follow; row-major when ambiguous.
    pub fn suggest_memory_format(&self) -> MemoryFormat {
        let rank = self.dim();
        if (rank == 4 || rank == 5)
            && self.is_contiguous(MemoryFormat::ChannelsLast)
            && !self.is_contiguous(MemoryFormat::Contiguous)
        {
            MemoryFormat::ChannelsLast
        } else {
            MemoryFormat::Contiguous
        }
    }

    /// Returns a tensor with canonical strides for `format`, copying only when
    /// the current strides differ.
    pub fn contiguous(&self, format: MemoryFormat) -> Self {
        if self.is_contiguous(format) {
            return self.clone();
        }
        let dst = strides_for(&self.shape, format);
        let (shape, src) = (&self.shape[..], &self.strides[..]);
        let storage = match &self.storage {
            Storage::Half(v) => Storage::Half(gather(v, shape, src, &dst)),
            Storage::Float(v) => Storage::Float(gather(v, shape, src, &dst)),
            Storage::Double(v) => Storage::Double(gather(v, shape, src, &dst)),
            Storage::BFloat16(v) => Storage::BFloat16(gather(v, shape, src, &dst)),
            Storage::Int32(v) => Storage::Int32(gather(v, shape, src, &dst)),
            Storage::UInt8(v) => Storage::UInt8(gather(v, shape, src, &dst)),
        };
        Self { shape: self.shape.clone(), strides: dst, storage, device: self.device }
    }

    /// Logical element read widened to `f64`.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.dim() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return None;
        }
        self.storage.get_f64(offset_of(index, &self.strides))
    }

    /// All elements in logical row-major order, widened to `f64`.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.numel());
        for_each_offset(&self.shape, &self.strides, |_, offset| {
            out.push(self.storage.get_f64(offset).unwrap_or(f64::NAN));
        });
        out
    }
}
