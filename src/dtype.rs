//! Element types understood by the convolution path.

use half::f16;

/// Numeric type of a tensor's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// IEEE 754 binary16.
    Half,
    /// IEEE 754 binary32.
    Float,
    /// IEEE 754 binary64.
    Double,
    /// bfloat16. Storable, but not accepted by any convolution engine.
    BFloat16,
    /// 32-bit signed integer.
    Int32,
    /// 8-bit unsigned integer.
    UInt8,
}

impl DataType {
    /// Whether convolution descriptors can be built for this type.
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double)
    }

    /// Width of one element.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Half | Self::BFloat16 => 2,
            Self::Float | Self::Int32 => 4,
            Self::Double => 8,
            Self::UInt8 => 1,
        }
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Half => "f16",
            Self::Float => "f32",
            Self::Double => "f64",
            Self::BFloat16 => "bf16",
            Self::Int32 => "i32",
            Self::UInt8 => "u8",
        };
        f.write_str(name)
    }
}

/// A floating-point scalar a convolution engine can compute on.
///
/// Engines accumulate in `f64` and narrow once per output element.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    /// The matching [`DataType`].
    const DATA_TYPE: DataType;

    /// Widens to `f64`.
    fn to_f64(self) -> f64;

    /// Narrows from `f64` (round to nearest).
    fn from_f64(v: f64) -> Self;

    /// The value after rounding through the next narrower float type, or the
    /// value itself when there is none.
    fn down_converted(self) -> f64;
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::Half;

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }

    fn down_converted(self) -> f64 {
        f16::to_f64(self)
    }
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(v: f64) -> Self {
        v as Self
    }

    fn down_converted(self) -> f64 {
        f16::from_f32(self).to_f64()
    }
}

impl Element for f64 {
    const DATA_TYPE: DataType = DataType::Double;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }

    #[allow(clippy::cast_possible_truncation)]
    fn down_converted(self) -> f64 {
        f64::from(self as f32)
    }
}

/// Rounds an `f32` to the 10-bit mantissa used by TF32 tensor cores.
///
/// Non-finite values pass through unchanged.
pub fn round_to_tf32(v: f32) -> f32 {
    if !v.is_finite() {
        return v;
    }
    let bits = v.to_bits();
    // round half away from zero on the 13 dropped mantissa bits
    let rounded = bits.wrapping_add(0x1000) & !0x1FFF;
    f32::from_bits(rounded)
}
