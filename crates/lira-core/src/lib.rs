//! # lira-core
//!
//! Core tensor types for the LIRA linear-recurrence kernels.
//!
//! Provides the foundational `Tensor` type with:
//! - Floating-point dtypes (F16, BF16, F32, F64) behind one byte-backed storage
//! - Widening/narrowing conversions to and from the `f64` accumulation type
//! - Zero-copy reshapes over shared storage
//! - A small reverse-mode autograd graph (`GradFn` / `GradNode`)

pub mod dtype;
pub mod element;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod ops;
pub mod error;
pub mod autograd;
pub mod prelude;

pub use dtype::DType;
pub use element::FloatElement;
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use error::LiraError;

pub type Result<T> = std::result::Result<T, LiraError>;
