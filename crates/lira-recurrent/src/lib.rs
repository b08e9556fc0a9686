//! # lira-recurrent
//!
//! Tensor-level fused gated linear recurrence.
//!
//! Provides:
//! - `fused_recurrent`: forward pass over `[BH, T, D]` or `[B, H, T, D]`
//!   tensors with optional scalar, key and value log-gates and an initial state
//! - `fused_recurrent_backward`: gradients for every input, including the
//!   gates, from upstream output and final-state gradients
//! - A `GradFn` node so the op plugs into the lira-core autograd graph
//! - Serde-friendly configuration

pub mod autograd;
pub mod config;
pub mod fused_recurrent;

pub use autograd::{FusedRecurrentBackward, FusedRecurrentSaved};
pub use config::{FusedRecurrentConfig, GateGradStrategy};
pub use fused_recurrent::{
    fused_recurrent, fused_recurrent_backward, resolve_dims, FusedRecurrentGrads,
    FusedRecurrentInputs, FusedRecurrentOutput, RecurrentDims,
};
