//! Element types a [`Tensor`](super::Tensor) can hold.

use core::fmt::{Debug, Display};
use core::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

use bytemuck::Pod;

/// Runtime tag of an element type.
///
/// The five-byte tags are the ones written into weight files. `Int64` has no
/// file tag; it only appears as the output of index-producing kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float64,
    Int64,
    Int32,
    Int16,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
            Self::Int16 => 2,
        }
    }

    /// Five-byte weight-file tag, if this type can be stored in one.
    pub const fn tag(self) -> Option<&'static [u8; 5]> {
        match self {
            Self::Float32 => Some(b"float"),
            Self::Float64 => Some(b"doubl"),
            Self::Int32 => Some(b"int32"),
            Self::Int16 => Some(b"int16"),
            Self::Int64 => None,
        }
    }

    /// Parses a weight-file tag.
    pub fn from_tag(tag: &[u8; 5]) -> Option<Self> {
        match tag {
            b"float" => Some(Self::Float32),
            b"doubl" => Some(Self::Float64),
            b"int32" => Some(Self::Int32),
            b"int16" => Some(Self::Int16),
            _ => None,
        }
    }
}

/// A plain-old-data element that can live in a tensor buffer.
pub trait Element: Pod + Default + PartialOrd + Debug + Display + Send + Sync + 'static {
    const DTYPE: DType;
}

/// Elements supporting the arithmetic used by GEMM, convolution and the
/// elementwise engine.
pub trait Scalar:
    Element
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
{
    const ZERO: Self;

    /// Lossy conversion from `f64` (truncating for integers).
    fn from_f64(x: f64) -> Self;
}

/// Floating point elements, needed by transcendental kernels.
pub trait Float: Scalar {
    fn exp(self) -> Self;
    fn tanh(self) -> Self;
    fn powf(self, p: Self) -> Self;
    fn sqrt(self) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => $dtype:ident, $zero:expr);* $(;)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }

            impl Scalar for $ty {
                const ZERO: Self = $zero;

                #[allow(clippy::cast_possible_truncation)]
                fn from_f64(x: f64) -> Self {
                    x as Self
                }
            }
        )*
    };
}

impl_scalar! {
    f32 => Float32, 0.0;
    f64 => Float64, 0.0;
    i64 => Int64, 0;
    i32 => Int32, 0;
    i16 => Int16, 0;
}

macro_rules! impl_float {
    ($($ty:ty),*) => {
        $(
            impl Float for $ty {
                #[inline]
                fn exp(self) -> Self {
                    <$ty>::exp(self)
                }

                #[inline]
                fn tanh(self) -> Self {
                    <$ty>::tanh(self)
                }

                #[inline]
                fn powf(self, p: Self) -> Self {
                    <$ty>::powf(self, p)
                }

                #[inline]
                fn sqrt(self) -> Self {
                    <$ty>::sqrt(self)
                }
            }
        )*
    };
}

impl_float!(f32, f64);
