//! Convenience re-exports for common lira-core types.
//!
//! ```rust
//! use lira_core::prelude::*;
//! ```

pub use crate::autograd::{GradFn, GradNode, NoGradGuard};
pub use crate::DType;
pub use crate::LiraError;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
