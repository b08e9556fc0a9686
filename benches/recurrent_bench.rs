//! Benchmark: blocked fused recurrence vs the unblocked reference, forward and backward.

use std::time::Instant;

use lira::lira_kernels::reference::naive_recurrence;
use lira::lira_kernels::{launch_forward, LaunchConfig, RecurrenceProblem};
use lira::{fused_recurrent, fused_recurrent_backward, FusedRecurrentConfig, FusedRecurrentInputs, Tensor};

fn synthetic(len: usize, mul: usize, add: usize, modulo: usize, shift: f64) -> Vec<f64> {
    (0..len).map(|i| ((i * mul + add) % modulo) as f64 * 0.1 - shift).collect()
}

fn time<F: FnMut()>(iters: usize, mut f: F) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Fused Recurrence Benchmark ===\n");
    println!("{:<20} {:>14} {:>14} {:>10}",
        "BHxTxDkxDv", "Naive (ms)", "Blocked (ms)", "Speedup");
    println!("{}", "-".repeat(62));

    let shapes: &[(usize, usize, usize, usize)] = &[
        (4, 128, 64, 64),
        (8, 256, 64, 64),
        (8, 256, 128, 128),
        (16, 512, 64, 128),
    ];

    for &(bh, t, dk, dv) in shapes {
        let q = synthetic(bh * t * dk, 7, 3, 13, 0.6);
        let k = synthetic(bh * t * dk, 11, 5, 17, 0.8);
        let v = synthetic(bh * t * dv, 5, 1, 11, 0.5);
        let gk: Vec<f64> = synthetic(bh * t * dk, 3, 2, 7, 0.0).iter().map(|x| -0.01 - 0.05 * x).collect();
        let problem = RecurrenceProblem {
            q: &q,
            k: &k,
            v: &v,
            g: None,
            gk: Some(&gk),
            gv: None,
            h0: None,
            batch_heads: bh,
            t_len: t,
            dk,
            dv,
        };
        let cfg = LaunchConfig::for_key_dim(dk);
        let iters = if t <= 128 { 20 } else if t <= 256 { 5 } else { 2 };

        let naive_s = time(iters, || {
            let _ = naive_recurrence(&problem, &cfg);
        });
        let blocked_s = time(iters, || {
            let _ = launch_forward(&problem, &cfg, true);
        });

        println!("{:<20} {:>12.3}ms {:>12.3}ms {:>9.1}x",
            format!("{}x{}x{}x{}", bh, t, dk, dv),
            naive_s * 1000.0,
            blocked_s * 1000.0,
            naive_s / blocked_s,
        );
    }

    println!("\n=== Forward + Backward (tensor API, f32) ===\n");
    println!("{:<20} {:>14} {:>14} {:>14}",
        "BHxTxD", "Forward (ms)", "Cumsum (ms)", "History (ms)");
    println!("{}", "-".repeat(66));

    for &(bh, t, d) in &[(4, 128, 64), (8, 256, 64), (8, 512, 128)] {
        let x = Tensor::narrow_from_f64(&synthetic(bh * t * d, 7, 3, 13, 0.6), &[bh, t, d], lira::DType::F32);
        let g = Tensor::narrow_from_f64(
            &synthetic(bh * t, 3, 1, 5, 0.5),
            &[bh, t],
            lira::DType::F32,
        );
        let d_o = Tensor::narrow_from_f64(&synthetic(bh * t * d, 5, 2, 11, 0.5), &[bh, t, d], lira::DType::F32);
        let inputs = FusedRecurrentInputs::new(&x, &x, &x).with_g(&g);
        let iters = if t <= 128 { 10 } else { 2 };

        let cumsum = FusedRecurrentConfig::default();
        let history = cumsum.clone().with_gate_grad(lira::GateGradStrategy::StateHistory);

        let fwd_s = time(iters, || {
            let _ = fused_recurrent(&inputs, &cumsum).unwrap();
        });
        let bwd = |cfg: &FusedRecurrentConfig| {
            let out = fused_recurrent(&inputs, cfg).unwrap();
            time(iters, || {
                let _ = fused_recurrent_backward(&out.saved, &d_o, None).unwrap();
            })
        };
        let cumsum_s = bwd(&cumsum);
        let history_s = bwd(&history);

        println!("{:<20} {:>12.3}ms {:>12.3}ms {:>12.3}ms",
            format!("{}x{}x{}", bh, t, d),
            fwd_s * 1000.0,
            cumsum_s * 1000.0,
            history_s * 1000.0,
        );
    }
}
