//! Property tests for the recurrence kernels against the unblocked reference
//! and against central finite differences.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use test_case::test_case;

use crate::gate::GateMode;
use crate::gate_grad::{derive_gate_grads, FinalStateTerm, GateGradInputs, GateSet};
use crate::partition::{launch_backward, launch_forward, BackwardRequest, LaunchConfig, RecurrenceProblem};
use crate::reference::naive_recurrence;
use crate::Acc;

const FD_EPS: Acc = 1e-5;
const FD_TOL: Acc = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Q,
    K,
    V,
    G,
    Gk,
    Gv,
    H0,
}

#[derive(Clone)]
struct Fixture {
    n: usize,
    t: usize,
    dk: usize,
    dv: usize,
    q: Vec<Acc>,
    k: Vec<Acc>,
    v: Vec<Acc>,
    g: Option<Vec<Acc>>,
    gk: Option<Vec<Acc>>,
    gv: Option<Vec<Acc>>,
    h0: Option<Vec<Acc>>,
}

fn rand_vec(rng: &mut StdRng, len: usize, lo: Acc, hi: Acc) -> Vec<Acc> {
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

impl Fixture {
    fn new(seed: u64, dims: (usize, usize, usize, usize), gates: GateSet, with_h0: bool) -> Self {
        let (n, t, dk, dv) = dims;
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            n,
            t,
            dk,
            dv,
            q: rand_vec(&mut rng, n * t * dk, -1.0, 1.0),
            k: rand_vec(&mut rng, n * t * dk, -1.0, 1.0),
            v: rand_vec(&mut rng, n * t * dv, -1.0, 1.0),
            g: gates.g.then(|| rand_vec(&mut rng, n * t, -0.4, 0.0)),
            gk: gates.gk.then(|| rand_vec(&mut rng, n * t * dk, -0.4, 0.0)),
            gv: gates.gv.then(|| rand_vec(&mut rng, n * t * dv, -0.4, 0.0)),
            h0: with_h0.then(|| rand_vec(&mut rng, n * dk * dv, -1.0, 1.0)),
        }
    }

    fn problem(&self) -> RecurrenceProblem<'_> {
        RecurrenceProblem {
            q: &self.q,
            k: &self.k,
            v: &self.v,
            g: self.g.as_deref(),
            gk: self.gk.as_deref(),
            gv: self.gv.as_deref(),
            h0: self.h0.as_deref(),
            batch_heads: self.n,
            t_len: self.t,
            dk: self.dk,
            dv: self.dv,
        }
    }

    fn gates(&self) -> GateSet {
        GateSet {
            g: self.g.is_some(),
            gk: self.gk.is_some(),
            gv: self.gv.is_some(),
        }
    }

    fn field_mut(&mut self, field: Field) -> Option<&mut Vec<Acc>> {
        match field {
            Field::Q => Some(&mut self.q),
            Field::K => Some(&mut self.k),
            Field::V => Some(&mut self.v),
            Field::G => self.g.as_mut(),
            Field::Gk => self.gk.as_mut(),
            Field::Gv => self.gv.as_mut(),
            Field::H0 => self.h0.as_mut(),
        }
    }
}

fn assert_close(actual: &[Acc], expected: &[Acc], tol: Acc, name: &str) {
    assert_eq!(actual.len(), expected.len(), "{name}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let err = (a - e).abs();
        let rel = err / e.abs().max(1.0);
        assert!(rel < tol, "{name}[{i}]: got {a}, expected {e} (rel err {rel:.3e})");
    }
}

fn config(dk: usize, reverse: bool, gate: GateMode, block: usize) -> LaunchConfig {
    LaunchConfig {
        reverse,
        gate,
        max_block_k: block,
        max_block_v: block,
        ..LaunchConfig::for_key_dim(dk)
    }
}

/// `L = Σ O ⊙ W + Σ HT ⊙ U` through the reference recurrence.
fn loss(fx: &Fixture, cfg: &LaunchConfig, w: &[Acc], u: &[Acc]) -> Acc {
    let out = naive_recurrence(&fx.problem(), cfg);
    let lo: Acc = out.output.iter().zip(w).map(|(a, b)| a * b).sum();
    let lh: Acc = out.final_state.iter().zip(u).map(|(a, b)| a * b).sum();
    lo + lh
}

fn numerical_grad(fx: &Fixture, field: Field, cfg: &LaunchConfig, w: &[Acc], u: &[Acc]) -> Vec<Acc> {
    let len = fx.clone().field_mut(field).map_or(0, |f| f.len());
    (0..len)
        .map(|idx| {
            let mut plus = fx.clone();
            let mut minus = fx.clone();
            if let (Some(p), Some(m)) = (plus.field_mut(field), minus.field_mut(field)) {
                p[idx] += FD_EPS;
                m[idx] -= FD_EPS;
            }
            (loss(&plus, cfg, w, u) - loss(&minus, cfg, w, u)) / (2.0 * FD_EPS)
        })
        .collect()
}

struct Analytic {
    dq: Vec<Acc>,
    dk: Vec<Acc>,
    dv: Vec<Acc>,
    dh0: Option<Vec<Acc>>,
    dg: Option<Vec<Acc>>,
    dgk: Option<Vec<Acc>>,
    dgv: Option<Vec<Acc>>,
}

fn analytic_grads(fx: &Fixture, cfg: &LaunchConfig, w: &[Acc], u: &[Acc], exact: bool) -> Analytic {
    let problem = fx.problem();
    let req = BackwardRequest {
        d_output: w,
        d_final_state: Some(u),
        want_dh0: fx.h0.is_some(),
        want_final_state: !exact,
        exact_gate_grads: exact,
    };
    let bwd = launch_backward(&problem, cfg, &req);
    if exact {
        return Analytic {
            dq: bwd.dq,
            dk: bwd.dk,
            dv: bwd.dv,
            dh0: bwd.dh0,
            dg: bwd.dg,
            dgk: bwd.dgk,
            dgv: bwd.dgv,
        };
    }

    let fwd = launch_forward(&problem, cfg, false);
    let ht = bwd.final_state.clone().unwrap_or_default();
    let inputs = GateGradInputs {
        q: &fx.q,
        k: &fx.k,
        v: &fx.v,
        o: &fwd.output,
        d_o: w,
        d_q: &bwd.dq,
        d_k: &bwd.dk,
        d_v: &bwd.dv,
        batch_heads: fx.n,
        t_len: fx.t,
        key_dim: fx.dk,
        value_dim: fx.dv,
        reverse: cfg.reverse,
    };
    let term = FinalStateTerm { d_final_state: u, final_state: &ht };
    let gates = derive_gate_grads(&inputs, fx.gates(), Some(term));
    Analytic {
        dq: bwd.dq,
        dk: bwd.dk,
        dv: bwd.dv,
        dh0: bwd.dh0,
        dg: gates.dg,
        dgk: gates.dgk,
        dgv: gates.dgv,
    }
}

fn check_all_grads(fx: &Fixture, cfg: &LaunchConfig, exact: bool) {
    let mut rng = StdRng::seed_from_u64(99);
    let w = rand_vec(&mut rng, fx.n * fx.t * fx.dv, -1.0, 1.0);
    let u = rand_vec(&mut rng, fx.n * fx.dk * fx.dv, -1.0, 1.0);
    let got = analytic_grads(fx, cfg, &w, &u, exact);

    assert_close(&got.dq, &numerical_grad(fx, Field::Q, cfg, &w, &u), FD_TOL, "dq");
    assert_close(&got.dk, &numerical_grad(fx, Field::K, cfg, &w, &u), FD_TOL, "dk");
    assert_close(&got.dv, &numerical_grad(fx, Field::V, cfg, &w, &u), FD_TOL, "dv");

    let optional = [
        (Field::H0, got.dh0.as_ref(), "dh0"),
        (Field::G, got.dg.as_ref(), "dg"),
        (Field::Gk, got.dgk.as_ref(), "dgk"),
        (Field::Gv, got.dgv.as_ref(), "dgv"),
    ];
    for (field, grad, name) in optional {
        let present = fx.clone().field_mut(field).is_some();
        assert_eq!(grad.is_some(), present, "{name}: presence");
        if let Some(grad) = grad {
            assert_close(grad, &numerical_grad(fx, field, cfg, &w, &u), FD_TOL, name);
        }
    }
}

const NO_GATES: GateSet = GateSet { g: false, gk: false, gv: false };
const ALL_GATES: GateSet = GateSet { g: true, gk: true, gv: true };
const SCALAR_GATE: GateSet = GateSet { g: true, gk: false, gv: false };
const KEY_GATE: GateSet = GateSet { g: false, gk: true, gv: false };
const VALUE_GATE: GateSet = GateSet { g: false, gk: false, gv: true };

// ============================================================================
// Reference equivalence
// ============================================================================

#[test_case(NO_GATES, false, GateMode::Standard ; "ungated forward")]
#[test_case(NO_GATES, true, GateMode::Standard ; "ungated reverse")]
#[test_case(ALL_GATES, false, GateMode::Standard ; "all gates forward")]
#[test_case(ALL_GATES, true, GateMode::Standard ; "all gates reverse")]
#[test_case(ALL_GATES, false, GateMode::Negative ; "negative gates forward")]
#[test_case(ALL_GATES, true, GateMode::Negative ; "negative gates reverse")]
#[test_case(KEY_GATE, false, GateMode::Standard ; "key gate only")]
#[test_case(VALUE_GATE, true, GateMode::Negative ; "value gate only negative reverse")]
fn test_matches_reference(gates: GateSet, reverse: bool, gate: GateMode) {
    // dk = 5, dv = 7 with 4-lane blocks: both dims end in a partial block.
    let fx = Fixture::new(1, (3, 9, 5, 7), gates, true);
    let cfg = config(fx.dk, reverse, gate, 4);
    let tiled = launch_forward(&fx.problem(), &cfg, true);
    let reference = naive_recurrence(&fx.problem(), &cfg);
    assert_close(&tiled.output, &reference.output, 1e-12, "output");
    assert_close(tiled.final_state.as_deref().unwrap(), &reference.final_state, 1e-12, "final_state");
}

#[test]
fn test_block_size_invariance() {
    let fx = Fixture::new(2, (2, 6, 40, 70), ALL_GATES, true);
    let small = launch_forward(&fx.problem(), &config(fx.dk, false, GateMode::Standard, 16), true);
    let large = launch_forward(&fx.problem(), &config(fx.dk, false, GateMode::Standard, 64), true);
    assert_close(&small.output, &large.output, 1e-12, "output");
    assert_close(
        small.final_state.as_deref().unwrap(),
        large.final_state.as_deref().unwrap(),
        1e-12,
        "final_state",
    );

    let mut rng = StdRng::seed_from_u64(3);
    let d_o = rand_vec(&mut rng, fx.n * fx.t * fx.dv, -1.0, 1.0);
    let req = BackwardRequest {
        d_output: &d_o,
        d_final_state: None,
        want_dh0: true,
        want_final_state: false,
        exact_gate_grads: true,
    };
    let a = launch_backward(&fx.problem(), &config(fx.dk, false, GateMode::Standard, 16), &req);
    let b = launch_backward(&fx.problem(), &config(fx.dk, false, GateMode::Standard, 64), &req);
    assert_close(&a.dq, &b.dq, 1e-12, "dq");
    assert_close(&a.dk, &b.dk, 1e-12, "dk");
    assert_close(&a.dv, &b.dv, 1e-12, "dv");
    assert_close(a.dgk.as_deref().unwrap(), b.dgk.as_deref().unwrap(), 1e-12, "dgk");
    assert_close(a.dgv.as_deref().unwrap(), b.dgv.as_deref().unwrap(), 1e-12, "dgv");
    assert_close(a.dg.as_deref().unwrap(), b.dg.as_deref().unwrap(), 1e-12, "dg");
}

#[test]
fn test_runs_are_bitwise_reproducible() {
    let fx = Fixture::new(4, (4, 8, 70, 20), ALL_GATES, false);
    let cfg = config(fx.dk, true, GateMode::Negative, 16);
    let a = launch_forward(&fx.problem(), &cfg, true);
    let b = launch_forward(&fx.problem(), &cfg, true);
    assert_eq!(a, b);

    let req = BackwardRequest {
        d_output: &a.output,
        d_final_state: a.final_state.as_deref(),
        want_dh0: false,
        want_final_state: true,
        exact_gate_grads: true,
    };
    assert_eq!(launch_backward(&fx.problem(), &cfg, &req), launch_backward(&fx.problem(), &cfg, &req));
}

#[test_case(GateMode::Standard ; "standard")]
#[test_case(GateMode::Negative ; "negative")]
fn test_zero_log_gates_match_ungated(gate: GateMode) {
    let ungated = Fixture::new(5, (2, 6, 3, 4), NO_GATES, true);
    let mut zeroed = ungated.clone();
    zeroed.g = Some(vec![0.0; ungated.n * ungated.t]);
    zeroed.gk = Some(vec![0.0; ungated.n * ungated.t * ungated.dk]);
    zeroed.gv = Some(vec![0.0; ungated.n * ungated.t * ungated.dv]);

    let cfg = config(ungated.dk, false, gate, 64);
    let a = launch_forward(&ungated.problem(), &cfg, true);
    let b = launch_forward(&zeroed.problem(), &cfg, true);
    assert_eq!(a, b);
}

/// Columns `range` of the time axis of a `[n, t, width]` buffer.
fn time_slice(buf: &[Acc], n: usize, t: usize, width: usize, range: std::ops::Range<usize>) -> Vec<Acc> {
    (0..n)
        .flat_map(|bh| buf[(bh * t + range.start) * width..(bh * t + range.end) * width].to_vec())
        .collect()
}

fn split_fixture(fx: &Fixture, range: std::ops::Range<usize>, h0: Option<Vec<Acc>>) -> Fixture {
    let (n, t) = (fx.n, fx.t);
    Fixture {
        n,
        t: range.len(),
        dk: fx.dk,
        dv: fx.dv,
        q: time_slice(&fx.q, n, t, fx.dk, range.clone()),
        k: time_slice(&fx.k, n, t, fx.dk, range.clone()),
        v: time_slice(&fx.v, n, t, fx.dv, range.clone()),
        g: fx.g.as_ref().map(|g| time_slice(g, n, t, 1, range.clone())),
        gk: fx.gk.as_ref().map(|g| time_slice(g, n, t, fx.dk, range.clone())),
        gv: fx.gv.as_ref().map(|g| time_slice(g, n, t, fx.dv, range.clone())),
        h0,
    }
}

#[test_case(false ; "forward")]
#[test_case(true ; "reverse")]
fn test_state_continuity(reverse: bool) {
    let t_half = 5;
    let full = Fixture::new(6, (2, 2 * t_half, 3, 5), ALL_GATES, true);
    let cfg = config(full.dk, reverse, GateMode::Standard, 2);
    let whole = launch_forward(&full.problem(), &cfg, true);

    let (first, second) = if reverse {
        (t_half..2 * t_half, 0..t_half)
    } else {
        (0..t_half, t_half..2 * t_half)
    };
    let a = split_fixture(&full, first.clone(), full.h0.clone());
    let out_a = launch_forward(&a.problem(), &cfg, true);
    let b = split_fixture(&full, second.clone(), out_a.final_state.clone());
    let out_b = launch_forward(&b.problem(), &cfg, true);

    let n = full.n;
    let dv = full.dv;
    assert_close(&out_a.output, &time_slice(&whole.output, n, full.t, dv, first), 1e-12, "first half");
    assert_close(&out_b.output, &time_slice(&whole.output, n, full.t, dv, second), 1e-12, "second half");
    assert_close(
        out_b.final_state.as_deref().unwrap(),
        whole.final_state.as_deref().unwrap(),
        1e-12,
        "final_state",
    );
}

// ============================================================================
// Gradients
// ============================================================================

#[test_case(NO_GATES, false, true ; "ungated with h0")]
#[test_case(NO_GATES, true, false ; "ungated reverse")]
#[test_case(ALL_GATES, false, true ; "all gates with h0")]
#[test_case(ALL_GATES, true, true ; "all gates reverse with h0")]
#[test_case(SCALAR_GATE, false, false ; "scalar gate")]
#[test_case(KEY_GATE, true, false ; "key gate reverse")]
#[test_case(VALUE_GATE, false, true ; "value gate with h0")]
fn test_cumsum_grads_match_finite_difference(gates: GateSet, reverse: bool, with_h0: bool) {
    let fx = Fixture::new(7, (2, 5, 3, 4), gates, with_h0);
    let cfg = config(fx.dk, reverse, GateMode::Standard, 2);
    check_all_grads(&fx, &cfg, false);
}

#[test_case(ALL_GATES, false, GateMode::Standard ; "standard forward")]
#[test_case(ALL_GATES, true, GateMode::Standard ; "standard reverse")]
#[test_case(ALL_GATES, false, GateMode::Negative ; "negative forward")]
#[test_case(ALL_GATES, true, GateMode::Negative ; "negative reverse")]
#[test_case(SCALAR_GATE, false, GateMode::Negative ; "negative scalar gate")]
#[test_case(KEY_GATE, true, GateMode::Negative ; "negative key gate reverse")]
#[test_case(VALUE_GATE, false, GateMode::Negative ; "negative value gate")]
#[test_case(NO_GATES, false, GateMode::Negative ; "negative mode without gates")]
fn test_exact_grads_match_finite_difference(gates: GateSet, reverse: bool, gate: GateMode) {
    let fx = Fixture::new(8, (2, 5, 3, 4), gates, true);
    let cfg = config(fx.dk, reverse, gate, 2);
    check_all_grads(&fx, &cfg, true);
}

#[test]
fn test_exact_and_cumsum_agree_for_standard_gates() {
    let fx = Fixture::new(9, (2, 6, 5, 3), ALL_GATES, true);
    let cfg = config(fx.dk, false, GateMode::Standard, 4);
    let mut rng = StdRng::seed_from_u64(10);
    let w = rand_vec(&mut rng, fx.n * fx.t * fx.dv, -1.0, 1.0);
    let u = rand_vec(&mut rng, fx.n * fx.dk * fx.dv, -1.0, 1.0);

    let exact = analytic_grads(&fx, &cfg, &w, &u, true);
    let cumsum = analytic_grads(&fx, &cfg, &w, &u, false);
    for (a, b, name) in [
        (&exact.dg, &cumsum.dg, "dg"),
        (&exact.dgk, &cumsum.dgk, "dgk"),
        (&exact.dgv, &cumsum.dgv, "dgv"),
    ] {
        assert_close(a.as_deref().unwrap(), b.as_deref().unwrap(), 1e-9, name);
    }
}
