//! Tensor-level fused gated linear recurrence.
//!
//! Accepts `[BH, T, D]` or `[B, H, T, D]` tensors of any float dtype,
//! widens them to `f64`, runs the tiled kernels, and narrows results back:
//! the output to the query dtype, the final state stays `f64`.

use std::sync::Arc;

use lira_core::{DType, LiraError, Result, Tensor};
use lira_kernels::gate_grad::{derive_gate_grads, FinalStateTerm, GateGradInputs};
use lira_kernels::{launch_backward, launch_forward, BackwardRequest};

use crate::autograd::{attach_grad_node, FusedRecurrentSaved, InputDTypes};
use crate::config::FusedRecurrentConfig;

/// Input tensors of one recurrence call.
///
/// `q`, `k`, `gk` share a shape `[.., T, Dk]`; `v`, `gv` are `[.., T, Dv]`;
/// `g` is `[.., T]`; the initial state is `[.., Dk, Dv]`.
#[derive(Clone, Copy, Debug)]
pub struct FusedRecurrentInputs<'a> {
    pub q: &'a Tensor,
    pub k: &'a Tensor,
    pub v: &'a Tensor,
    pub g: Option<&'a Tensor>,
    pub gk: Option<&'a Tensor>,
    pub gv: Option<&'a Tensor>,
    pub initial_state: Option<&'a Tensor>,
}

impl<'a> FusedRecurrentInputs<'a> {
    pub fn new(q: &'a Tensor, k: &'a Tensor, v: &'a Tensor) -> Self {
        Self {
            q,
            k,
            v,
            g: None,
            gk: None,
            gv: None,
            initial_state: None,
        }
    }

    pub fn with_g(mut self, g: &'a Tensor) -> Self {
        self.g = Some(g);
        self
    }

    pub fn with_gk(mut self, gk: &'a Tensor) -> Self {
        self.gk = Some(gk);
        self
    }

    pub fn with_gv(mut self, gv: &'a Tensor) -> Self {
        self.gv = Some(gv);
        self
    }

    pub fn with_initial_state(mut self, h0: &'a Tensor) -> Self {
        self.initial_state = Some(h0);
        self
    }
}

/// Resolved problem dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecurrentDims {
    /// Leading (batch/head) dims, flattened into `batch_heads`.
    pub lead: Vec<usize>,
    pub batch_heads: usize,
    pub t_len: usize,
    pub dk: usize,
    pub dv: usize,
}

impl RecurrentDims {
    /// `[.., T, last]`.
    pub fn sequence_shape(&self, last: usize) -> Vec<usize> {
        let mut shape = self.lead.clone();
        shape.extend([self.t_len, last]);
        shape
    }

    /// `[.., T]`.
    pub fn gate_shape(&self) -> Vec<usize> {
        let mut shape = self.lead.clone();
        shape.push(self.t_len);
        shape
    }

    /// `[.., Dk, Dv]`.
    pub fn state_shape(&self) -> Vec<usize> {
        let mut shape = self.lead.clone();
        shape.extend([self.dk, self.dv]);
        shape
    }
}

fn expect_shape(tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.shape().dims() != expected {
        return Err(LiraError::ShapeMismatch {
            expected: expected.to_vec(),
            got: tensor.shape().dims().to_vec(),
        });
    }
    Ok(())
}

/// Check every input against the query's shape before any work is launched.
pub fn resolve_dims(inputs: &FusedRecurrentInputs<'_>) -> Result<RecurrentDims> {
    let q_shape = inputs.q.shape();
    let q_dims = q_shape.dims();
    let ndim = q_dims.len();
    let batch_heads = match (ndim, q_shape.leading_numel(2)) {
        (3 | 4, Some(batch_heads)) => batch_heads,
        _ => {
            return Err(LiraError::InvalidRank {
                name: "q".into(),
                expected: "3 ([BH, T, D]) or 4 ([B, H, T, D])".into(),
                got: ndim,
            })
        }
    };
    expect_shape(inputs.k, q_dims)?;

    let lead = q_dims[..ndim - 2].to_vec();
    let t_len = q_dims[ndim - 2];
    let dk = q_dims[ndim - 1];

    let v_dims = inputs.v.shape().dims();
    if v_dims.len() != ndim {
        return Err(LiraError::InvalidRank {
            name: "v".into(),
            expected: ndim.to_string(),
            got: v_dims.len(),
        });
    }
    let dv = v_dims[ndim - 1];
    let dims = RecurrentDims {
        batch_heads,
        lead,
        t_len,
        dk,
        dv,
    };
    expect_shape(inputs.v, &dims.sequence_shape(dv))?;

    if dk == 0 || dv == 0 {
        return Err(LiraError::InvalidConfig(format!(
            "key and value dims must be at least 1, got dk={dk}, dv={dv}"
        )));
    }

    if let Some(g) = inputs.g {
        expect_shape(g, &dims.gate_shape())?;
    }
    if let Some(gk) = inputs.gk {
        expect_shape(gk, &dims.sequence_shape(dk))?;
    }
    if let Some(gv) = inputs.gv {
        expect_shape(gv, &dims.sequence_shape(dv))?;
    }
    if let Some(h0) = inputs.initial_state {
        expect_shape(h0, &dims.state_shape())?;
    }
    Ok(dims)
}

/// Forward results.
#[derive(Clone, Debug)]
pub struct FusedRecurrentOutput {
    /// `[.., T, Dv]` in the query dtype. Carries a `GradNode` when any
    /// input tracks gradients.
    pub output: Tensor,
    /// `[.., Dk, Dv]` in `f64`, when requested.
    pub final_state: Option<Tensor>,
    /// Context for [`fused_recurrent_backward`].
    pub saved: Arc<FusedRecurrentSaved>,
}

/// Gradients of one recurrence call.
#[derive(Clone, Debug)]
pub struct FusedRecurrentGrads {
    /// Query dtype.
    pub dq: Tensor,
    /// Key dtype.
    pub dk: Tensor,
    /// Value dtype.
    pub dv: Tensor,
    /// Gate gradients in `f64`, present only for supplied gates.
    pub dg: Option<Tensor>,
    pub dgk: Option<Tensor>,
    pub dgv: Option<Tensor>,
    /// Initial-state dtype, present only when an initial state was supplied.
    pub d_initial_state: Option<Tensor>,
}

/// Run the gated linear recurrence.
///
/// # Examples
///
/// ```
/// use lira_core::Tensor;
/// use lira_recurrent::{fused_recurrent, FusedRecurrentConfig, FusedRecurrentInputs};
///
/// let ones = Tensor::from_f32(&[1.0; 8], &[1, 4, 2]);
/// let cfg = FusedRecurrentConfig::default().with_scale(1.0);
/// let out = fused_recurrent(&FusedRecurrentInputs::new(&ones, &ones, &ones), &cfg).unwrap();
/// assert_eq!(out.output.as_f32_slice().unwrap(), &[2.0, 2.0, 4.0, 4.0, 6.0, 6.0, 8.0, 8.0]);
/// ```
pub fn fused_recurrent(
    inputs: &FusedRecurrentInputs<'_>,
    config: &FusedRecurrentConfig,
) -> Result<FusedRecurrentOutput> {
    config.validate()?;
    let dims = resolve_dims(inputs)?;
    tracing::debug!(
        lead = ?dims.lead,
        t_len = dims.t_len,
        dk = dims.dk,
        dv = dims.dv,
        dtype = %inputs.q.dtype(),
        "fused_recurrent"
    );

    let saved = FusedRecurrentSaved {
        q: inputs.q.to_f64_vec(),
        k: inputs.k.to_f64_vec(),
        v: inputs.v.to_f64_vec(),
        g: inputs.g.map(Tensor::to_f64_vec),
        gk: inputs.gk.map(Tensor::to_f64_vec),
        gv: inputs.gv.map(Tensor::to_f64_vec),
        h0: inputs.initial_state.map(Tensor::to_f64_vec),
        output: Vec::new(),
        dtypes: InputDTypes::of(inputs),
        dims,
        config: config.clone(),
    };

    let launch = config.launch_config(saved.dims.dk);
    let result = launch_forward(&saved.problem(), &launch, config.output_final_state);

    let dims = &saved.dims;
    let output = Tensor::narrow_from_f64(&result.output, &dims.sequence_shape(dims.dv), inputs.q.dtype());
    let final_state = result
        .final_state
        .map(|ht| Tensor::from_f64(&ht, &dims.state_shape()));

    let saved = Arc::new(FusedRecurrentSaved {
        output: result.output,
        ..saved
    });
    let output = attach_grad_node(output, inputs, &saved);

    Ok(FusedRecurrentOutput {
        output,
        final_state,
        saved,
    })
}

/// Gradients of `fused_recurrent` given the upstream gradients.
///
/// `d_output` has the output's shape (any dtype); `d_final_state`, when
/// given, has the final state's shape.
pub fn fused_recurrent_backward(
    saved: &FusedRecurrentSaved,
    d_output: &Tensor,
    d_final_state: Option<&Tensor>,
) -> Result<FusedRecurrentGrads> {
    let dims = &saved.dims;
    expect_shape(d_output, &dims.sequence_shape(dims.dv))?;
    if let Some(d_ht) = d_final_state {
        expect_shape(d_ht, &dims.state_shape())?;
    }

    let config = &saved.config;
    let gates = saved.gate_set();
    let exact = config.exact_gate_grads() && gates.any();
    let d_o = d_output.to_f64_vec();
    let d_ht = d_final_state.map(Tensor::to_f64_vec);

    let problem = saved.problem();
    let request = BackwardRequest {
        d_output: &d_o,
        d_final_state: d_ht.as_deref(),
        want_dh0: saved.h0.is_some(),
        want_final_state: !exact && gates.any() && d_ht.is_some(),
        exact_gate_grads: exact,
    };
    let result = launch_backward(&problem, &config.launch_config(dims.dk), &request);

    let (dg, dgk, dgv) = if exact {
        (result.dg, result.dgk, result.dgv)
    } else if gates.any() {
        let inputs = GateGradInputs {
            q: &saved.q,
            k: &saved.k,
            v: &saved.v,
            o: &saved.output,
            d_o: &d_o,
            d_q: &result.dq,
            d_k: &result.dk,
            d_v: &result.dv,
            batch_heads: dims.batch_heads,
            t_len: dims.t_len,
            key_dim: dims.dk,
            value_dim: dims.dv,
            reverse: config.reverse,
        };
        let term = match (d_ht.as_deref(), result.final_state.as_deref()) {
            (Some(d_final_state), Some(final_state)) => Some(FinalStateTerm {
                d_final_state,
                final_state,
            }),
            _ => None,
        };
        let derived = derive_gate_grads(&inputs, gates, term);
        (derived.dg, derived.dgk, derived.dgv)
    } else {
        (None, None, None)
    };

    let dtypes = &saved.dtypes;
    let gate_tensor = |data: Vec<f64>, shape: Vec<usize>| Tensor::from_f64(&data, &shape);
    Ok(FusedRecurrentGrads {
        dq: Tensor::narrow_from_f64(&result.dq, &dims.sequence_shape(dims.dk), dtypes.q),
        dk: Tensor::narrow_from_f64(&result.dk, &dims.sequence_shape(dims.dk), dtypes.k),
        dv: Tensor::narrow_from_f64(&result.dv, &dims.sequence_shape(dims.dv), dtypes.v),
        dg: dg.map(|d| gate_tensor(d, dims.gate_shape())),
        dgk: dgk.map(|d| gate_tensor(d, dims.sequence_shape(dims.dk))),
        dgv: dgv.map(|d| gate_tensor(d, dims.sequence_shape(dims.dv))),
        d_initial_state: result.dh0.map(|d| {
            Tensor::narrow_from_f64(&d, &dims.state_shape(), dtypes.h0.unwrap_or(DType::F64))
        }),
    })
}
