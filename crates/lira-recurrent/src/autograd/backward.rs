//! Backward node for `fused_recurrent`.

use std::sync::Arc;

use lira_core::autograd::GradFn;
use lira_core::Tensor;

use super::forward_saved::FusedRecurrentSaved;
use crate::fused_recurrent::fused_recurrent_backward;

/// Which forward input a graph edge belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradSlot {
    Query,
    Key,
    Value,
    Gate,
    KeyGate,
    ValueGate,
    InitialState,
}

/// Propagates the output gradient to every tracked input.
///
/// The final state is not part of the graph, so only `dO` flows in here;
/// callers that need `dHT` use `fused_recurrent_backward` directly.
///
/// An upstream gradient whose shape differs from the output's panics.
pub struct FusedRecurrentBackward {
    pub saved: Arc<FusedRecurrentSaved>,
    /// One entry per input node, in node order.
    pub slots: Vec<GradSlot>,
}

impl GradFn for FusedRecurrentBackward {
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>> {
        let grads = fused_recurrent_backward(&self.saved, grad_output, None)
            .unwrap_or_else(|e| panic!("FusedRecurrentBackward: {e}"));

        // Gate gradients come back in f64; hand each input one in its own dtype.
        let dtypes = self.saved.dtypes;
        let cast = |grad: Option<Tensor>, dtype: Option<lira_core::DType>| match (grad, dtype) {
            (Some(grad), Some(dtype)) => Some(grad.to_dtype(dtype)),
            _ => None,
        };

        let mut dq = Some(grads.dq);
        let mut dk = Some(grads.dk);
        let mut dv = Some(grads.dv);
        let mut dg = cast(grads.dg, dtypes.g);
        let mut dgk = cast(grads.dgk, dtypes.gk);
        let mut dgv = cast(grads.dgv, dtypes.gv);
        let mut dh0 = grads.d_initial_state;

        self.slots
            .iter()
            .map(|slot| match slot {
                GradSlot::Query => dq.take(),
                GradSlot::Key => dk.take(),
                GradSlot::Value => dv.take(),
                GradSlot::Gate => dg.take(),
                GradSlot::KeyGate => dgk.take(),
                GradSlot::ValueGate => dgv.take(),
                GradSlot::InitialState => dh0.take(),
            })
            .collect()
    }

    fn name(&self) -> &str {
        "FusedRecurrentBackward"
    }
}
