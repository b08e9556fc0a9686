//! Element-wise tensor arithmetic.
//!
//! Operations return new tensors and never touch the autograd graph.

pub mod arithmetic;
