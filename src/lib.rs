//! # lira
//!
//! Fused gated linear recurrence on the CPU.
//!
//! ```text
//! H_t = diag(d(gk_t)) · H_{t−1} · diag(d(gv_t)) · d(g_t) + k_t ⊗ v_t
//! o_t = Hᵀ_t · (scale · q_t)
//! ```
//!
//! This crate re-exports the workspace members:
//! - [`lira_core`]: tensors, dtypes and the autograd graph
//! - [`lira_kernels`]: slice-level tiled kernels
//! - [`lira_recurrent`]: the tensor-level `fused_recurrent` op

pub use lira_core;
pub use lira_kernels;
pub use lira_recurrent;

pub use lira_core::{DType, LiraError, Result, Tensor};
pub use lira_recurrent::{
    fused_recurrent, fused_recurrent_backward, FusedRecurrentConfig, FusedRecurrentGrads,
    FusedRecurrentInputs, FusedRecurrentOutput, GateGradStrategy,
};
