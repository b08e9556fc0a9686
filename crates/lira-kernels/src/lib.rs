//! # lira-kernels
//!
//! Slice-level CPU kernels for the fused gated linear recurrence.
//!
//! Provides:
//! - Gate transforms (standard `exp` and negative-gate `2·exp − 1`)
//! - Key/value block partitioning with masked lane buffers
//! - Forward and backward recurrence executors for one state tile
//! - A rayon orchestrator that launches one executor per
//!   (batch-head, key-block, value-block) and reduces partials in a fixed order
//! - Time-axis cumulative sums and gate-gradient derivation
//! - An unblocked single-tile reference recurrence
//!
//! Every kernel works on row-major `f64` buffers; widening from and
//! narrowing to the tensor dtypes happens in the caller.

pub mod gate;
pub mod tile;
pub mod cpu_recurrent;
pub mod cpu_recurrent_backward;
pub mod partition;
pub mod cumsum;
pub mod gate_grad;
pub mod reference;

#[cfg(test)]
mod tests;

/// Accumulation precision for every kernel.
pub type Acc = f64;

pub use gate::GateMode;
pub use partition::{
    launch_backward, launch_forward, BackwardRequest, BackwardResult, ForwardResult, LaunchConfig,
    RecurrenceProblem,
};
pub use tile::{Block, BlockLayout, MAX_BLOCK};
