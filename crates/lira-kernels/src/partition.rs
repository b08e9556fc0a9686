//! Partition/reduction orchestrator.
//!
//! Splits the key and value dimensions into blocks, runs one executor per
//! (batch-head, key-block, value-block) work item on the rayon pool, then
//! reduces the partials per batch-head. Work items are ordered bh-major,
//! then key-block, then value-block, and the reduction walks them in that
//! order, so results are bitwise identical from run to run.

use rayon::prelude::*;

use crate::cpu_recurrent::{forward_tile, ForwardTile, HeadInputs, RecurrenceParams};
use crate::cpu_recurrent_backward::{backward_tile, BackwardOptions, BackwardTile};
use crate::gate::GateMode;
use crate::tile::{Block, BlockLayout, MAX_BLOCK};
use crate::Acc;

/// Row-major `Acc` inputs for all batch-heads.
///
/// `q`, `k`, `gk` are `[batch_heads, t_len, dk]`; `v`, `gv` are
/// `[batch_heads, t_len, dv]`; `g` is `[batch_heads, t_len]`; `h0` is
/// `[batch_heads, dk, dv]`.
#[derive(Debug, Clone, Copy)]
pub struct RecurrenceProblem<'a> {
    pub q: &'a [Acc],
    pub k: &'a [Acc],
    pub v: &'a [Acc],
    pub g: Option<&'a [Acc]>,
    pub gk: Option<&'a [Acc]>,
    pub gv: Option<&'a [Acc]>,
    pub h0: Option<&'a [Acc]>,
    pub batch_heads: usize,
    pub t_len: usize,
    pub dk: usize,
    pub dv: usize,
}

impl<'a> RecurrenceProblem<'a> {
    /// Slices belonging to batch-head `bh`.
    pub fn head(&self, bh: usize) -> HeadInputs<'a> {
        let (t, dk, dv) = (self.t_len, self.dk, self.dv);
        let part = |buf: &'a [Acc], len: usize| &buf[bh * len..(bh + 1) * len];
        HeadInputs {
            q: part(self.q, t * dk),
            k: part(self.k, t * dk),
            v: part(self.v, t * dv),
            g: self.g.map(|g| part(g, t)),
            gk: self.gk.map(|gk| part(gk, t * dk)),
            gv: self.gv.map(|gv| part(gv, t * dv)),
            h0: self.h0.map(|h0| part(h0, dk * dv)),
            t_len: t,
            dk,
            dv,
        }
    }

    pub fn has_gates(&self) -> bool {
        self.g.is_some() || self.gk.is_some() || self.gv.is_some()
    }

    fn assert_consistent(&self) {
        let (n, t, dk, dv) = (self.batch_heads, self.t_len, self.dk, self.dv);
        assert!(dk >= 1 && dv >= 1, "state dims must be at least 1, got {dk}x{dv}");
        assert_eq!(self.q.len(), n * t * dk, "q length");
        assert_eq!(self.k.len(), n * t * dk, "k length");
        assert_eq!(self.v.len(), n * t * dv, "v length");
        if let Some(g) = self.g {
            assert_eq!(g.len(), n * t, "g length");
        }
        if let Some(gk) = self.gk {
            assert_eq!(gk.len(), n * t * dk, "gk length");
        }
        if let Some(gv) = self.gv {
            assert_eq!(gv.len(), n * t * dv, "gv length");
        }
        if let Some(h0) = self.h0 {
            assert_eq!(h0.len(), n * dk * dv, "h0 length");
        }
    }
}

/// Launch-wide settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchConfig {
    pub scale: Acc,
    pub reverse: bool,
    pub gate: GateMode,
    pub max_block_k: usize,
    pub max_block_v: usize,
}

impl LaunchConfig {
    /// Forward-direction, standard gates, `scale = dk^-0.5`, 64-lane blocks.
    pub fn for_key_dim(dk: usize) -> Self {
        Self {
            scale: (dk as Acc).powf(-0.5),
            reverse: false,
            gate: GateMode::Standard,
            max_block_k: MAX_BLOCK,
            max_block_v: MAX_BLOCK,
        }
    }

    fn params(&self) -> RecurrenceParams {
        RecurrenceParams {
            scale: self.scale,
            reverse: self.reverse,
            gate: self.gate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    bh: usize,
    kb: Block,
    vb: Block,
}

struct Grid {
    keys: BlockLayout,
    values: BlockLayout,
    items: Vec<WorkItem>,
}

impl Grid {
    fn new(problem: &RecurrenceProblem<'_>, cfg: &LaunchConfig) -> Self {
        let keys = BlockLayout::new(problem.dk, cfg.max_block_k);
        let values = BlockLayout::new(problem.dv, cfg.max_block_v);
        let mut items = Vec::with_capacity(problem.batch_heads * keys.count * values.count);
        for bh in 0..problem.batch_heads {
            for kb in keys.blocks() {
                for vb in values.blocks() {
                    items.push(WorkItem { bh, kb, vb });
                }
            }
        }
        Self { keys, values, items }
    }

    fn per_head(&self) -> usize {
        self.keys.count * self.values.count
    }
}

fn log_launch(stage: &str, problem: &RecurrenceProblem<'_>, cfg: &LaunchConfig, grid: &Grid) {
    tracing::debug!(
        stage,
        batch_heads = problem.batch_heads,
        t_len = problem.t_len,
        dk = problem.dk,
        dv = problem.dv,
        block_k = grid.keys.size,
        block_v = grid.values.size,
        nk = grid.keys.count,
        nv = grid.values.count,
        work_items = grid.items.len(),
        reverse = cfg.reverse,
        negative_gates = cfg.gate.is_negative(),
        scale = cfg.scale,
        "launching fused recurrence"
    );
    if cfg.gate.is_negative() && !problem.has_gates() {
        tracing::warn!(stage, "negative-gate mode requested but no gate tensors supplied");
    }
}

/// Run `f` on every batch-head's chunk of `dst` in parallel.
fn reduce_heads<F>(dst: &mut [Acc], head_len: usize, f: F)
where
    F: Fn(usize, &mut [Acc]) + Send + Sync,
{
    if head_len == 0 {
        return;
    }
    dst.par_chunks_mut(head_len)
        .enumerate()
        .for_each(|(bh, chunk)| f(bh, chunk));
}

/// `dst[r, block.start + c] += src[r, c]` for a `[rows, block.len]` partial.
fn add_block_rows(dst: &mut [Acc], row_len: usize, src: &[Acc], block: Block) {
    for (dst_row, src_row) in dst.chunks_exact_mut(row_len).zip(src.chunks_exact(block.len)) {
        for (d, &s) in dst_row[block.start..block.start + block.len].iter_mut().zip(src_row) {
            *d += s;
        }
    }
}

/// Write a `[kb.len, vb.len]` tile into a `[dk, dv]` matrix.
fn scatter_tile(dst: &mut [Acc], dv: usize, tile: &[Acc], kb: Block, vb: Block) {
    for (i, src_row) in tile.chunks_exact(vb.len).enumerate() {
        let start = (kb.start + i) * dv + vb.start;
        dst[start..start + vb.len].copy_from_slice(src_row);
    }
}

/// Reduced forward results.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult {
    /// `[batch_heads, t_len, dv]`.
    pub output: Vec<Acc>,
    /// `[batch_heads, dk, dv]`.
    pub final_state: Option<Vec<Acc>>,
}

/// Forward pass over every batch-head.
pub fn launch_forward(
    problem: &RecurrenceProblem<'_>,
    cfg: &LaunchConfig,
    output_final_state: bool,
) -> ForwardResult {
    problem.assert_consistent();
    let grid = Grid::new(problem, cfg);
    log_launch("forward", problem, cfg, &grid);

    let params = cfg.params();
    let partials: Vec<ForwardTile> = grid
        .items
        .par_iter()
        .map(|w| forward_tile(&problem.head(w.bh), w.kb, w.vb, &params, output_final_state))
        .collect();

    tracing::trace!(partials = partials.len(), "reducing forward partials");
    let per_head = grid.per_head();
    let (t_len, dk, dv) = (problem.t_len, problem.dk, problem.dv);

    let mut output = vec![0.0; problem.batch_heads * t_len * dv];
    reduce_heads(&mut output, t_len * dv, |bh, out| {
        let tiles = &partials[bh * per_head..(bh + 1) * per_head];
        for (tile, w) in tiles.iter().zip(&grid.items[bh * per_head..]) {
            add_block_rows(out, dv, &tile.output, w.vb);
        }
    });

    let final_state = output_final_state.then(|| {
        let mut ht = vec![0.0; problem.batch_heads * dk * dv];
        reduce_heads(&mut ht, dk * dv, |bh, state| {
            let tiles = &partials[bh * per_head..(bh + 1) * per_head];
            for (tile, w) in tiles.iter().zip(&grid.items[bh * per_head..]) {
                if let Some(ref tile_state) = tile.final_state {
                    scatter_tile(state, dv, tile_state, w.kb, w.vb);
                }
            }
        });
        ht
    });

    ForwardResult { output, final_state }
}

/// Upstream gradients and requested extras for [`launch_backward`].
#[derive(Debug, Clone, Copy)]
pub struct BackwardRequest<'a> {
    /// `[batch_heads, t_len, dv]`.
    pub d_output: &'a [Acc],
    /// `[batch_heads, dk, dv]`.
    pub d_final_state: Option<&'a [Acc]>,
    pub want_dh0: bool,
    pub want_final_state: bool,
    pub exact_gate_grads: bool,
}

/// Reduced backward results.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardResult {
    /// `[batch_heads, t_len, dk]`.
    pub dq: Vec<Acc>,
    /// `[batch_heads, t_len, dk]`.
    pub dk: Vec<Acc>,
    /// `[batch_heads, t_len, dv]`.
    pub dv: Vec<Acc>,
    /// `[batch_heads, dk, dv]`.
    pub dh0: Option<Vec<Acc>>,
    /// State rebuilt by pass 1, `[batch_heads, dk, dv]`.
    pub final_state: Option<Vec<Acc>>,
    /// Exact gate gradients (state-history path only).
    pub dg: Option<Vec<Acc>>,
    pub dgk: Option<Vec<Acc>>,
    pub dgv: Option<Vec<Acc>>,
}

/// Backward pass over every batch-head.
pub fn launch_backward(
    problem: &RecurrenceProblem<'_>,
    cfg: &LaunchConfig,
    req: &BackwardRequest<'_>,
) -> BackwardResult {
    problem.assert_consistent();
    let (n, t_len, dk, dv) = (problem.batch_heads, problem.t_len, problem.dk, problem.dv);
    assert_eq!(req.d_output.len(), n * t_len * dv, "d_output length");
    if let Some(d_ht) = req.d_final_state {
        assert_eq!(d_ht.len(), n * dk * dv, "d_final_state length");
    }

    let grid = Grid::new(problem, cfg);
    log_launch("backward", problem, cfg, &grid);

    let params = cfg.params();
    let opts = BackwardOptions {
        want_dh0: req.want_dh0,
        want_final_state: req.want_final_state,
        exact_gate_grads: req.exact_gate_grads,
    };
    let partials: Vec<BackwardTile> = grid
        .items
        .par_iter()
        .map(|w| {
            let d_o = &req.d_output[w.bh * t_len * dv..(w.bh + 1) * t_len * dv];
            let d_ht = req.d_final_state.map(|d| &d[w.bh * dk * dv..(w.bh + 1) * dk * dv]);
            backward_tile(&problem.head(w.bh), d_o, d_ht, w.kb, w.vb, &params, opts)
        })
        .collect();

    tracing::trace!(partials = partials.len(), "reducing backward partials");
    let per_head = grid.per_head();
    let head_tiles = |bh: usize| {
        partials[bh * per_head..(bh + 1) * per_head]
            .iter()
            .zip(&grid.items[bh * per_head..(bh + 1) * per_head])
    };

    let key_rows = |select: fn(&BackwardTile) -> Option<&[Acc]>| {
        let mut buf = vec![0.0; n * t_len * dk];
        reduce_heads(&mut buf, t_len * dk, |bh, dst| {
            for (tile, w) in head_tiles(bh) {
                if let Some(src) = select(tile) {
                    add_block_rows(dst, dk, src, w.kb);
                }
            }
        });
        buf
    };
    let value_rows = |select: fn(&BackwardTile) -> Option<&[Acc]>| {
        let mut buf = vec![0.0; n * t_len * dv];
        reduce_heads(&mut buf, t_len * dv, |bh, dst| {
            for (tile, w) in head_tiles(bh) {
                if let Some(src) = select(tile) {
                    add_block_rows(dst, dv, src, w.vb);
                }
            }
        });
        buf
    };
    let state_tiles = |select: fn(&BackwardTile) -> Option<&[Acc]>| {
        let mut buf = vec![0.0; n * dk * dv];
        reduce_heads(&mut buf, dk * dv, |bh, dst| {
            for (tile, w) in head_tiles(bh) {
                if let Some(src) = select(tile) {
                    scatter_tile(dst, dv, src, w.kb, w.vb);
                }
            }
        });
        buf
    };

    let dq = key_rows(|t| Some(t.dq.as_slice()));
    let dk_grad = key_rows(|t| Some(t.dk.as_slice()));
    let dv_grad = value_rows(|t| Some(t.dv.as_slice()));
    let dh0 = req.want_dh0.then(|| state_tiles(|t| t.dh0.as_deref()));
    let final_state = req.want_final_state.then(|| state_tiles(|t| t.final_state.as_deref()));

    let exact = req.exact_gate_grads;
    let dgk = (exact && problem.gk.is_some()).then(|| {
        key_rows(|t| t.gate_grads.as_ref().and_then(|g| g.dgk.as_deref()))
    });
    let dgv = (exact && problem.gv.is_some()).then(|| {
        value_rows(|t| t.gate_grads.as_ref().and_then(|g| g.dgv.as_deref()))
    });
    let dg = (exact && problem.g.is_some()).then(|| {
        let mut buf = vec![0.0; n * t_len];
        reduce_heads(&mut buf, t_len, |bh, dst| {
            for (tile, _) in head_tiles(bh) {
                if let Some(src) = tile.gate_grads.as_ref().and_then(|g| g.dg.as_deref()) {
                    dst.iter_mut().zip(src).for_each(|(d, &s)| *d += s);
                }
            }
        });
        buf
    });

    BackwardResult {
        dq,
        dk: dk_grad,
        dv: dv_grad,
        dh0,
        final_state,
        dg,
        dgk,
        dgv,
    }
}
