//! Backward recurrence executor for one (batch-head, key-block, value-block) tile.
//!
//! Two passes over time:
//! 1. Recurrence direction: rebuild the state and emit
//!    `dq[t] = scale · Σ_value H_t ⊙ do[t]`.
//! 2. Opposite direction: carry `dH`, fold in `scale·q[t] ⊗ do[t]`, emit
//!    `dk[t] = Σ_value dH ⊙ v[t]` and `dv[t] = Σ_key dH ⊙ k[t]`, then decay
//!    `dH` by the step's gates. What is left after the sweep is `dH0`.
//!
//! With exact gate gradients enabled, pass 1 keeps the state entering every
//! step and pass 2 accumulates `dH_t ⊙ H_{t−1}` against the gate derivatives.

use crate::cpu_recurrent::{compact_tile, load_state_tile, HeadInputs, RecurrenceParams, StepGates};
use crate::tile::{time_steps, Block};
use crate::Acc;

/// What a backward tile should produce beyond dq/dk/dv.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Return the leftover `dH` as the initial-state gradient.
    pub want_dh0: bool,
    /// Return the state rebuilt by pass 1 (the final state `HT`).
    pub want_final_state: bool,
    /// Accumulate gate gradients from the stored state history.
    pub exact_gate_grads: bool,
}

/// Gate-gradient partials of one tile.
///
/// Each field is `Some` only when the matching gate is present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileGateGrads {
    /// `[t_len]`, partial over both key- and value-blocks.
    pub dg: Option<Vec<Acc>>,
    /// `[t_len, kb.len]`, partial over value-blocks.
    pub dgk: Option<Vec<Acc>>,
    /// `[t_len, vb.len]`, partial over key-blocks.
    pub dgv: Option<Vec<Acc>>,
}

/// Partial gradients of one backward tile.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardTile {
    /// `[t_len, kb.len]`, partial over value-blocks.
    pub dq: Vec<Acc>,
    /// `[t_len, kb.len]`, partial over value-blocks.
    pub dk: Vec<Acc>,
    /// `[t_len, vb.len]`, partial over key-blocks.
    pub dv: Vec<Acc>,
    /// `[kb.len, vb.len]`.
    pub dh0: Option<Vec<Acc>>,
    /// `[kb.len, vb.len]`.
    pub final_state: Option<Vec<Acc>>,
    pub gate_grads: Option<TileGateGrads>,
}

/// Run both backward passes over one state tile.
///
/// `d_o` is `[t_len, dv]` and `d_ht` is `[dk, dv]`, both for this batch-head.
pub fn backward_tile(
    head: &HeadInputs<'_>,
    d_o: &[Acc],
    d_ht: Option<&[Acc]>,
    kb: Block,
    vb: Block,
    params: &RecurrenceParams,
    opts: BackwardOptions,
) -> BackwardTile {
    let (bk, bv) = (kb.width, vb.width);
    let t_len = head.t_len;
    let tile_len = bk * bv;

    let mut b_q = vec![0.0; bk];
    let mut b_k = vec![0.0; bk];
    let mut b_v = vec![0.0; bv];
    let mut b_do = vec![0.0; bv];
    let mut gates = StepGates::new(kb, vb);

    // ---- Pass 1: rebuild H, emit dq ----
    let mut h = vec![0.0; tile_len];
    load_state_tile(head, kb, vb, &mut h);
    let mut history = if opts.exact_gate_grads {
        vec![0.0; t_len * tile_len]
    } else {
        Vec::new()
    };
    let mut dq = vec![0.0; t_len * kb.len];

    for t in time_steps(t_len, params.reverse) {
        kb.load(head.key_row(head.k, t), &mut b_k);
        vb.load(head.value_row(head.v, t), &mut b_v);
        vb.load(head.value_row(d_o, t), &mut b_do);
        gates.load(head, kb, vb, t, params.gate);

        if opts.exact_gate_grads {
            history[t * tile_len..(t + 1) * tile_len].copy_from_slice(&h);
        }
        gates.decay(head, &mut h, bv);

        let dq_row = &mut dq[t * kb.len..(t + 1) * kb.len];
        for (i, row) in h.chunks_exact_mut(bv).enumerate() {
            let ki = b_k[i];
            let mut acc = 0.0;
            for j in 0..bv {
                row[j] += ki * b_v[j];
                acc += row[j] * b_do[j];
            }
            if i < kb.len {
                dq_row[i] = acc * params.scale;
            }
        }
    }
    let final_state = opts.want_final_state.then(|| compact_tile(&h, kb, vb));

    // ---- Pass 2: carry dH in the opposite direction ----
    let mut dh = vec![0.0; tile_len];
    if let Some(d_ht) = d_ht {
        for i in 0..kb.len {
            let row = &d_ht[(kb.start + i) * head.dv..(kb.start + i + 1) * head.dv];
            vb.load(row, &mut dh[i * bv..(i + 1) * bv]);
        }
    }

    let mut dk = vec![0.0; t_len * kb.len];
    let mut dv = vec![0.0; t_len * vb.len];
    let mut b_dv = vec![0.0; bv];
    let mut grads = opts.exact_gate_grads.then(|| TileGateGrads {
        dg: head.g.map(|_| vec![0.0; t_len]),
        dgk: head.gk.map(|_| vec![0.0; t_len * kb.len]),
        dgv: head.gv.map(|_| vec![0.0; t_len * vb.len]),
    });
    let mut d_fk = vec![0.0; bk];
    let mut d_fv = vec![0.0; bv];

    for t in time_steps(t_len, !params.reverse) {
        kb.load_scaled(head.key_row(head.q, t), params.scale, &mut b_q);
        kb.load(head.key_row(head.k, t), &mut b_k);
        vb.load(head.value_row(head.v, t), &mut b_v);
        vb.load(head.value_row(d_o, t), &mut b_do);
        gates.load(head, kb, vb, t, params.gate);

        b_dv.fill(0.0);
        let dk_row = &mut dk[t * kb.len..(t + 1) * kb.len];
        for (i, row) in dh.chunks_exact_mut(bv).enumerate() {
            let (qi, ki) = (b_q[i], b_k[i]);
            let mut acc = 0.0;
            for j in 0..bv {
                row[j] += qi * b_do[j];
                acc += row[j] * b_v[j];
                b_dv[j] += row[j] * ki;
            }
            if i < kb.len {
                dk_row[i] = acc;
            }
        }
        dv[t * vb.len..(t + 1) * vb.len].copy_from_slice(&b_dv[..vb.len]);

        if let Some(grads) = grads.as_mut() {
            let h_prev = &history[t * tile_len..(t + 1) * tile_len];
            for (d, &x) in d_fk.iter_mut().zip(&gates.xk) {
                *d = params.gate.derivative(x);
            }
            for (d, &x) in d_fv.iter_mut().zip(&gates.xv) {
                *d = params.gate.derivative(x);
            }
            let d_fs = params.gate.derivative(gates.xs);
            accumulate_gate_grads(grads, &dh, h_prev, &gates, &d_fk, &d_fv, d_fs, t, kb, vb);
        }

        gates.decay(head, &mut dh, bv);
    }

    BackwardTile {
        dq,
        dk,
        dv,
        dh0: opts.want_dh0.then(|| compact_tile(&dh, kb, vb)),
        final_state,
        gate_grads: grads,
    }
}

/// `∂L/∂x` for each gate at step `t`, given `dH_t` and `H_{t−1}`.
///
/// With `H_t = fs · fv_j · fk_i · H_{t−1} + k ⊗ v`, each gate's derivative
/// replaces its own factor in the product.
#[allow(clippy::too_many_arguments)]
fn accumulate_gate_grads(
    grads: &mut TileGateGrads,
    dh: &[Acc],
    h_prev: &[Acc],
    gates: &StepGates,
    d_fk: &[Acc],
    d_fv: &[Acc],
    d_fs: Acc,
    t: usize,
    kb: Block,
    vb: Block,
) {
    let bv = vb.width;
    let mut dg = 0.0;
    for i in 0..kb.len {
        let mut dgk_i = 0.0;
        for j in 0..vb.len {
            let base = dh[i * bv + j] * h_prev[i * bv + j];
            dgk_i += base * d_fk[i] * gates.fv[j] * gates.fs;
            if let Some(dgv) = grads.dgv.as_mut() {
                dgv[t * vb.len + j] += base * gates.fk[i] * d_fv[j] * gates.fs;
            }
            dg += base * gates.fk[i] * gates.fv[j] * d_fs;
        }
        if let Some(dgk) = grads.dgk.as_mut() {
            dgk[t * kb.len + i] = dgk_i;
        }
    }
    if let Some(dg_out) = grads.dg.as_mut() {
        dg_out[t] = dg;
    }
}
