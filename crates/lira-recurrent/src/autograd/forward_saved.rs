//! Forward context kept for the backward pass.

use std::sync::Arc;

use lira_core::autograd::{is_grad_enabled, GradNode};
use lira_core::{DType, Tensor};
use lira_kernels::gate_grad::GateSet;
use lira_kernels::RecurrenceProblem;

use super::backward::{FusedRecurrentBackward, GradSlot};
use crate::config::FusedRecurrentConfig;
use crate::fused_recurrent::{FusedRecurrentInputs, RecurrentDims};

/// Dtypes of the tensors a call was made with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputDTypes {
    pub q: DType,
    pub k: DType,
    pub v: DType,
    pub g: Option<DType>,
    pub gk: Option<DType>,
    pub gv: Option<DType>,
    pub h0: Option<DType>,
}

impl InputDTypes {
    pub(crate) fn of(inputs: &FusedRecurrentInputs<'_>) -> Self {
        Self {
            q: inputs.q.dtype(),
            k: inputs.k.dtype(),
            v: inputs.v.dtype(),
            g: inputs.g.map(Tensor::dtype),
            gk: inputs.gk.map(Tensor::dtype),
            gv: inputs.gv.map(Tensor::dtype),
            h0: inputs.initial_state.map(Tensor::dtype),
        }
    }
}

/// Everything the backward pass needs, widened to `f64`.
///
/// Only the inputs and the output are kept. Intermediate states are
/// recomputed inside the backward kernel.
#[derive(Debug)]
pub struct FusedRecurrentSaved {
    pub(crate) q: Vec<f64>,
    pub(crate) k: Vec<f64>,
    pub(crate) v: Vec<f64>,
    pub(crate) g: Option<Vec<f64>>,
    pub(crate) gk: Option<Vec<f64>>,
    pub(crate) gv: Option<Vec<f64>>,
    pub(crate) h0: Option<Vec<f64>>,
    pub(crate) output: Vec<f64>,
    pub(crate) dtypes: InputDTypes,
    pub(crate) dims: RecurrentDims,
    pub(crate) config: FusedRecurrentConfig,
}

impl FusedRecurrentSaved {
    pub fn dims(&self) -> &RecurrentDims {
        &self.dims
    }

    pub fn config(&self) -> &FusedRecurrentConfig {
        &self.config
    }

    pub fn dtypes(&self) -> &InputDTypes {
        &self.dtypes
    }

    pub(crate) fn gate_set(&self) -> GateSet {
        GateSet {
            g: self.g.is_some(),
            gk: self.gk.is_some(),
            gv: self.gv.is_some(),
        }
    }

    pub(crate) fn problem(&self) -> RecurrenceProblem<'_> {
        RecurrenceProblem {
            q: &self.q,
            k: &self.k,
            v: &self.v,
            g: self.g.as_deref(),
            gk: self.gk.as_deref(),
            gv: self.gv.as_deref(),
            h0: self.h0.as_deref(),
            batch_heads: self.dims.batch_heads,
            t_len: self.dims.t_len,
            dk: self.dims.dk,
            dv: self.dims.dv,
        }
    }
}

/// Attach a `FusedRecurrentBackward` node to `output` if any input tracks
/// gradients and grad mode is on.
pub(crate) fn attach_grad_node(
    output: Tensor,
    inputs: &FusedRecurrentInputs<'_>,
    saved: &Arc<FusedRecurrentSaved>,
) -> Tensor {
    if !is_grad_enabled() {
        return output;
    }

    let candidates = [
        (GradSlot::Query, Some(inputs.q)),
        (GradSlot::Key, Some(inputs.k)),
        (GradSlot::Value, Some(inputs.v)),
        (GradSlot::Gate, inputs.g),
        (GradSlot::KeyGate, inputs.gk),
        (GradSlot::ValueGate, inputs.gv),
        (GradSlot::InitialState, inputs.initial_state),
    ];

    let mut slots = Vec::new();
    let mut nodes = Vec::new();
    for (slot, tensor) in candidates {
        if let Some(node) = tensor.filter(|t| t.tracks_grad()).and_then(Tensor::grad_node) {
            slots.push(slot);
            nodes.push(Arc::clone(node));
        }
    }
    if nodes.is_empty() {
        return output;
    }

    tracing::trace!(?slots, "recording FusedRecurrentBackward");
    let grad_fn = Box::new(FusedRecurrentBackward {
        saved: Arc::clone(saved),
        slots,
    });
    output.with_grad_node(GradNode::with_grad_fn(grad_fn, nodes))
}
