use crate::dtype::DType;

/// Errors raised by tensor construction, validation and kernel dispatch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LiraError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Invalid rank for {name}: expected {expected}, got {got}")]
    InvalidRank { name: String, expected: String, got: usize },

    #[error("Cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("DType mismatch: {lhs} vs {rhs}")]
    DTypeMismatch { lhs: DType, rhs: DType },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
