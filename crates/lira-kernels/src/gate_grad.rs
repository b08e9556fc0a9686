//! Gate gradients from reduced input gradients via a time-axis cumulative sum.
//!
//! For `d(x) = exp(x)` the log-gate gradients satisfy
//!
//! ```text
//! dgk[t] = Σ_{s after t} (dq ⊙ q − dk ⊙ k)[s]     (per key channel)
//! dgv[t] = Σ_{s after t} (do ⊙ o − dv ⊙ v)[s]     (per value channel)
//! dg[t]  = Σ_key dgk[t]
//! ```
//!
//! where "after" follows the recurrence direction (inclusive), so the sum
//! runs from the end for a forward recurrence. A supplied final-state
//! gradient adds `⟨dHT, HT⟩`, split per channel, to every timestep.

use rayon::prelude::*;

use crate::cumsum::cumsum_time;
use crate::Acc;

/// Reduced forward/backward quantities for all batch-heads.
///
/// Key-side buffers are `[batch_heads, t_len, key_dim]`, value-side ones
/// `[batch_heads, t_len, value_dim]`.
#[derive(Debug, Clone, Copy)]
pub struct GateGradInputs<'a> {
    pub q: &'a [Acc],
    pub k: &'a [Acc],
    pub v: &'a [Acc],
    pub o: &'a [Acc],
    pub d_o: &'a [Acc],
    pub d_q: &'a [Acc],
    pub d_k: &'a [Acc],
    pub d_v: &'a [Acc],
    pub batch_heads: usize,
    pub t_len: usize,
    pub key_dim: usize,
    pub value_dim: usize,
    pub reverse: bool,
}

/// `dHT` and the matching `HT`, both `[batch_heads, key_dim, value_dim]`.
#[derive(Debug, Clone, Copy)]
pub struct FinalStateTerm<'a> {
    pub d_final_state: &'a [Acc],
    pub final_state: &'a [Acc],
}

/// Which gate gradients to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSet {
    pub g: bool,
    pub gk: bool,
    pub gv: bool,
}

impl GateSet {
    pub fn any(&self) -> bool {
        self.g || self.gk || self.gv
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateGrads {
    /// `[batch_heads, t_len]`.
    pub dg: Option<Vec<Acc>>,
    /// `[batch_heads, t_len, key_dim]`.
    pub dgk: Option<Vec<Acc>>,
    /// `[batch_heads, t_len, value_dim]`.
    pub dgv: Option<Vec<Acc>>,
}

/// Per-channel `dHT ⊙ HT` sums of one batch-head: (rows, columns, total).
fn final_state_channels(d_ht: &[Acc], ht: &[Acc], key_dim: usize, value_dim: usize) -> (Vec<Acc>, Vec<Acc>, Acc) {
    let mut rows = vec![0.0; key_dim];
    let mut cols = vec![0.0; value_dim];
    for (i, (d_row, h_row)) in d_ht.chunks_exact(value_dim).zip(ht.chunks_exact(value_dim)).enumerate() {
        for (j, (&d, &h)) in d_row.iter().zip(h_row).enumerate() {
            let p = d * h;
            rows[i] += p;
            cols[j] += p;
        }
    }
    let total = rows.iter().sum();
    (rows, cols, total)
}

/// Add `offsets[c]` to channel `c` of every timestep of every batch-head.
fn add_channel_offsets(buf: &mut [Acc], t_len: usize, width: usize, offsets: &[Vec<Acc>]) {
    if t_len * width == 0 {
        return;
    }
    buf.par_chunks_mut(t_len * width)
        .zip(offsets.par_iter())
        .for_each(|(head, off)| {
            for row in head.chunks_exact_mut(width) {
                row.iter_mut().zip(off).for_each(|(x, &c)| *x += c);
            }
        });
}

/// `a ⊙ da − b ⊙ db`, element-wise.
fn local_term(a: &[Acc], da: &[Acc], b: &[Acc], db: &[Acc]) -> Vec<Acc> {
    a.par_iter()
        .zip(da.par_iter())
        .zip(b.par_iter().zip(db.par_iter()))
        .map(|((&a, &da), (&b, &db))| a * da - b * db)
        .collect()
}

/// Derive the requested gate gradients with the cumulative-sum identity.
pub fn derive_gate_grads(
    inputs: &GateGradInputs<'_>,
    gates: GateSet,
    final_term: Option<FinalStateTerm<'_>>,
) -> GateGrads {
    let (n, t_len, dk, dv) = (inputs.batch_heads, inputs.t_len, inputs.key_dim, inputs.value_dim);
    let from_end = !inputs.reverse;
    tracing::trace!(batch_heads = n, t_len, from_end, "deriving gate gradients by cumulative sum");

    let corrections: Option<Vec<(Vec<Acc>, Vec<Acc>, Acc)>> = final_term.map(|term| {
        term.d_final_state
            .par_chunks(dk * dv)
            .zip(term.final_state.par_chunks(dk * dv))
            .map(|(d_ht, ht)| final_state_channels(d_ht, ht, dk, dv))
            .collect()
    });

    let mut out = GateGrads::default();

    if gates.g || gates.gk {
        let key_term = local_term(inputs.q, inputs.d_q, inputs.k, inputs.d_k);

        if gates.g {
            let mut dg: Vec<Acc> = key_term.par_chunks(dk).map(|row| row.iter().sum()).collect();
            cumsum_time(&mut dg, t_len, 1, from_end);
            if let Some(ref corr) = corrections {
                let totals: Vec<Vec<Acc>> = corr.iter().map(|c| vec![c.2]).collect();
                add_channel_offsets(&mut dg, t_len, 1, &totals);
            }
            out.dg = Some(dg);
        }

        if gates.gk {
            let mut dgk = key_term;
            cumsum_time(&mut dgk, t_len, dk, from_end);
            if let Some(ref corr) = corrections {
                let rows: Vec<Vec<Acc>> = corr.iter().map(|c| c.0.clone()).collect();
                add_channel_offsets(&mut dgk, t_len, dk, &rows);
            }
            out.dgk = Some(dgk);
        }
    }

    if gates.gv {
        let mut dgv = local_term(inputs.o, inputs.d_o, inputs.v, inputs.d_v);
        cumsum_time(&mut dgv, t_len, dv, from_end);
        if let Some(ref corr) = corrections {
            let cols: Vec<Vec<Acc>> = corr.iter().map(|c| c.1.clone()).collect();
            add_channel_offsets(&mut dgv, t_len, dv, &cols);
        }
        out.dgv = Some(dgv);
    }

    out
}
