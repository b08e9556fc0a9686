//! Autograd support for the fused recurrence.
//!
//! `fused_recurrent` saves its widened inputs in a `FusedRecurrentSaved`
//! and, when any input tracks gradients, hangs a `FusedRecurrentBackward`
//! node on the output.

mod backward;
mod forward_saved;


pub use backward::{FusedRecurrentBackward, GradSlot};
pub use forward_saved::{FusedRecurrentSaved, InputDTypes};

pub(crate) use forward_saved::attach_grad_node;
