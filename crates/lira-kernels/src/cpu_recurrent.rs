//! Forward recurrence executor for one (batch-head, key-block, value-block) tile.
//!
//! Per step the state tile `H` (key lanes × value lanes) is decayed by the
//! key gate (rows), the value gate (columns) and the scalar gate, in that
//! order; then `H += k ⊗ v` and `o = Σ_key H ⊙ (scale·q)`.

use crate::gate::GateMode;
use crate::tile::{time_steps, Block};
use crate::Acc;

/// Row-major views of one batch-head's inputs, already widened to `Acc`.
///
/// `q`, `k`, `gk` are `[t_len, dk]`; `v`, `gv` are `[t_len, dv]`; `g` is
/// `[t_len]`; `h0` is `[dk, dv]`.
#[derive(Debug, Clone, Copy)]
pub struct HeadInputs<'a> {
    pub q: &'a [Acc],
    pub k: &'a [Acc],
    pub v: &'a [Acc],
    pub g: Option<&'a [Acc]>,
    pub gk: Option<&'a [Acc]>,
    pub gv: Option<&'a [Acc]>,
    pub h0: Option<&'a [Acc]>,
    pub t_len: usize,
    pub dk: usize,
    pub dv: usize,
}

impl<'a> HeadInputs<'a> {
    pub(crate) fn key_row(&self, buf: &'a [Acc], t: usize) -> &'a [Acc] {
        &buf[t * self.dk..(t + 1) * self.dk]
    }

    pub(crate) fn value_row(&self, buf: &'a [Acc], t: usize) -> &'a [Acc] {
        &buf[t * self.dv..(t + 1) * self.dv]
    }
}

/// Per-launch constants shared by every tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecurrenceParams {
    pub scale: Acc,
    pub reverse: bool,
    pub gate: GateMode,
}

/// Decay factors of one timestep, expanded to lane buffers.
///
/// Absent gates leave their factors at one.
pub(crate) struct StepGates {
    pub fk: Vec<Acc>,
    pub fv: Vec<Acc>,
    pub fs: Acc,
    /// Raw log-gates, kept for derivative evaluation.
    pub xk: Vec<Acc>,
    pub xv: Vec<Acc>,
    pub xs: Acc,
}

impl StepGates {
    pub fn new(kb: Block, vb: Block) -> Self {
        Self {
            fk: vec![1.0; kb.width],
            fv: vec![1.0; vb.width],
            fs: 1.0,
            xk: vec![0.0; kb.width],
            xv: vec![0.0; vb.width],
            xs: 0.0,
        }
    }

    /// Load the gates of timestep `t` and transform them.
    #[inline]
    pub fn load(&mut self, head: &HeadInputs<'_>, kb: Block, vb: Block, t: usize, mode: GateMode) {
        if let Some(gk) = head.gk {
            kb.load(head.key_row(gk, t), &mut self.xk);
            self.fk.copy_from_slice(&self.xk);
            mode.decay_in_place(&mut self.fk);
        }
        if let Some(gv) = head.gv {
            vb.load(head.value_row(gv, t), &mut self.xv);
            self.fv.copy_from_slice(&self.xv);
            mode.decay_in_place(&mut self.fv);
        }
        if let Some(g) = head.g {
            self.xs = g[t];
            self.fs = mode.decay(self.xs);
        }
    }

    /// `tile[i][j] *= fk[i]`, then `*= fv[j]`, then `*= fs`.
    #[inline]
    pub fn decay(&self, head: &HeadInputs<'_>, tile: &mut [Acc], bv: usize) {
        if head.gk.is_some() {
            for (row, &f) in tile.chunks_exact_mut(bv).zip(&self.fk) {
                row.iter_mut().for_each(|h| *h *= f);
            }
        }
        if head.gv.is_some() {
            for row in tile.chunks_exact_mut(bv) {
                row.iter_mut().zip(&self.fv).for_each(|(h, &f)| *h *= f);
            }
        }
        if head.g.is_some() {
            let f = self.fs;
            tile.iter_mut().for_each(|h| *h *= f);
        }
    }
}

/// Load the `h0` tile into a zeroed `[kb.width, vb.width]` buffer.
pub(crate) fn load_state_tile(head: &HeadInputs<'_>, kb: Block, vb: Block, tile: &mut [Acc]) {
    tile.fill(0.0);
    if let Some(h0) = head.h0 {
        for i in 0..kb.len {
            let row = &h0[(kb.start + i) * head.dv..(kb.start + i + 1) * head.dv];
            vb.load(row, &mut tile[i * vb.width..(i + 1) * vb.width]);
        }
    }
}

/// Compact the in-range part of a `[kb.width, vb.width]` tile to `[kb.len, vb.len]`.
pub(crate) fn compact_tile(tile: &[Acc], kb: Block, vb: Block) -> Vec<Acc> {
    let mut out = Vec::with_capacity(kb.len * vb.len);
    for row in tile.chunks_exact(vb.width).take(kb.len) {
        out.extend_from_slice(&row[..vb.len]);
    }
    out
}

/// Partial results of one forward tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardTile {
    /// `[t_len, vb.len]`, this key-block's share of the output.
    pub output: Vec<Acc>,
    /// `[kb.len, vb.len]` state after the last step.
    pub final_state: Option<Vec<Acc>>,
}

/// Run the forward recurrence over one state tile.
pub fn forward_tile(
    head: &HeadInputs<'_>,
    kb: Block,
    vb: Block,
    params: &RecurrenceParams,
    want_final_state: bool,
) -> ForwardTile {
    let (bk, bv) = (kb.width, vb.width);
    let mut h = vec![0.0; bk * bv];
    load_state_tile(head, kb, vb, &mut h);

    let mut b_q = vec![0.0; bk];
    let mut b_k = vec![0.0; bk];
    let mut b_v = vec![0.0; bv];
    let mut b_o = vec![0.0; bv];
    let mut gates = StepGates::new(kb, vb);
    let mut output = vec![0.0; head.t_len * vb.len];

    for t in time_steps(head.t_len, params.reverse) {
        kb.load_scaled(head.key_row(head.q, t), params.scale, &mut b_q);
        kb.load(head.key_row(head.k, t), &mut b_k);
        vb.load(head.value_row(head.v, t), &mut b_v);
        gates.load(head, kb, vb, t, params.gate);

        gates.decay(head, &mut h, bv);

        b_o.fill(0.0);
        for (i, row) in h.chunks_exact_mut(bv).enumerate() {
            let (ki, qi) = (b_k[i], b_q[i]);
            for j in 0..bv {
                row[j] += ki * b_v[j];
                b_o[j] += row[j] * qi;
            }
        }

        output[t * vb.len..(t + 1) * vb.len].copy_from_slice(&b_o[..vb.len]);
    }

    ForwardTile {
        output,
        final_state: want_final_state.then(|| compact_tile(&h, kb, vb)),
    }
}
