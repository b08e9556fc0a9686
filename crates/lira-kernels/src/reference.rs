//! Unblocked reference recurrence.
//!
//! One state matrix per batch-head covering the full key and value
//! dimensions, no lane buffers and no masking. Slow, but a direct
//! transcription of
//!
//! ```text
//! H_t = diag(d(gk_t)) · H_{t−1} · diag(d(gv_t)) · d(g_t) + k_t ⊗ v_t
//! o_t = Hᵀ_t · (scale · q_t)
//! ```

use crate::partition::{LaunchConfig, RecurrenceProblem};
use crate::tile::time_steps;
use crate::Acc;

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutput {
    /// `[batch_heads, t_len, dv]`.
    pub output: Vec<Acc>,
    /// `[batch_heads, dk, dv]`.
    pub final_state: Vec<Acc>,
}

/// Run the recurrence one batch-head at a time on the calling thread.
///
/// Block sizes in `cfg` are ignored.
pub fn naive_recurrence(problem: &RecurrenceProblem<'_>, cfg: &LaunchConfig) -> ReferenceOutput {
    let (n, t_len, dk, dv) = (problem.batch_heads, problem.t_len, problem.dk, problem.dv);
    let mut output = vec![0.0; n * t_len * dv];
    let mut final_state = vec![0.0; n * dk * dv];

    for bh in 0..n {
        let head = problem.head(bh);
        let s = &mut final_state[bh * dk * dv..(bh + 1) * dk * dv];
        if let Some(h0) = head.h0 {
            s.copy_from_slice(h0);
        }

        for t in time_steps(t_len, cfg.reverse) {
            let fs = head.g.map_or(1.0, |g| cfg.gate.decay(g[t]));
            for i in 0..dk {
                let fk = head.gk.map_or(1.0, |gk| cfg.gate.decay(gk[t * dk + i]));
                for j in 0..dv {
                    let fv = head.gv.map_or(1.0, |gv| cfg.gate.decay(gv[t * dv + j]));
                    let h = &mut s[i * dv + j];
                    *h = *h * fk * fv * fs + head.k[t * dk + i] * head.v[t * dv + j];
                }
            }

            let o = &mut output[(bh * t_len + t) * dv..(bh * t_len + t + 1) * dv];
            for (j, o_j) in o.iter_mut().enumerate() {
                *o_j = (0..dk)
                    .map(|i| s[i * dv + j] * head.q[t * dk + i] * cfg.scale)
                    .sum();
            }
        }
    }

    ReferenceOutput { output, final_state }
}
