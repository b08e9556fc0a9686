//! Host element types that can back a tensor.

use bytemuck::Pod;
use half::{bf16, f16};

use crate::dtype::DType;

/// A plain-old-data float type with a fixed `DType` tag.
///
/// Conversions go through `f64`, the accumulation type of the kernels.
pub trait FloatElement: Pod + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

impl FloatElement for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl FloatElement for bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        bf16::from_f64(value)
    }
}

impl FloatElement for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl FloatElement for f64 {
    const DTYPE: DType = DType::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }
}
