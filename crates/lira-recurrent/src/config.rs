//! Configuration for the fused recurrence op.

use serde::{Deserialize, Serialize};

use lira_core::{LiraError, Result};
use lira_kernels::{GateMode, LaunchConfig, MAX_BLOCK};

/// How gate gradients are computed in the backward pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateGradStrategy {
    /// `StateHistory` in negative-gate mode, `CumulativeSum` otherwise.
    #[default]
    Auto,
    /// Time-axis cumulative sum over reduced dQ/dK/dV. Only valid for
    /// standard gates; `validate` rejects it in negative-gate mode.
    CumulativeSum,
    /// Keep the state entering every step and accumulate exact gradients.
    /// Costs one state tile per timestep of extra memory.
    StateHistory,
}

impl GateGradStrategy {
    /// Concrete strategy for the given gate mode (never `Auto`).
    pub fn resolve(self, use_negative_gates: bool) -> Self {
        match self {
            GateGradStrategy::Auto if use_negative_gates => GateGradStrategy::StateHistory,
            GateGradStrategy::Auto => GateGradStrategy::CumulativeSum,
            other => other,
        }
    }
}

/// Fused gated linear recurrence configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusedRecurrentConfig {
    /// Query scale; `None` means `dk^-0.5`.
    pub scale: Option<f64>,
    pub output_final_state: bool,
    /// Walk time from the last step to the first.
    pub reverse: bool,
    /// Use `2·exp(x) − 1` instead of `exp(x)` as the decay.
    pub use_negative_gates: bool,
    pub max_block_k: usize,
    pub max_block_v: usize,
    pub gate_grad: GateGradStrategy,
}

impl Default for FusedRecurrentConfig {
    fn default() -> Self {
        Self {
            scale: None,
            output_final_state: false,
            reverse: false,
            use_negative_gates: false,
            max_block_k: MAX_BLOCK,
            max_block_v: MAX_BLOCK,
            gate_grad: GateGradStrategy::Auto,
        }
    }
}

impl FusedRecurrentConfig {
    /// Reverse-time preset.
    pub fn reversed() -> Self {
        Self {
            reverse: true,
            ..Self::default()
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_final_state(mut self, output_final_state: bool) -> Self {
        self.output_final_state = output_final_state;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_negative_gates(mut self, use_negative_gates: bool) -> Self {
        self.use_negative_gates = use_negative_gates;
        self
    }

    pub fn with_block_sizes(mut self, max_block_k: usize, max_block_v: usize) -> Self {
        self.max_block_k = max_block_k;
        self.max_block_v = max_block_v;
        self
    }

    pub fn with_gate_grad(mut self, gate_grad: GateGradStrategy) -> Self {
        self.gate_grad = gate_grad;
        self
    }

    /// Reject zero block sizes, non-finite scales, and a cumulative-sum
    /// gate gradient under negative gates.
    pub fn validate(&self) -> Result<()> {
        if self.max_block_k == 0 || self.max_block_v == 0 {
            return Err(LiraError::InvalidConfig(format!(
                "block sizes must be positive, got {}x{}",
                self.max_block_k, self.max_block_v
            )));
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() {
                return Err(LiraError::InvalidConfig(format!("scale must be finite, got {scale}")));
            }
        }
        if self.use_negative_gates && self.gate_grad == GateGradStrategy::CumulativeSum {
            return Err(LiraError::InvalidConfig(
                "cumulative-sum gate gradients assume exp gates; use state_history or auto with negative gates".into(),
            ));
        }
        Ok(())
    }

    /// Explicit scale, or `dk^-0.5`.
    pub fn resolved_scale(&self, dk: usize) -> f64 {
        self.scale.unwrap_or_else(|| (dk as f64).powf(-0.5))
    }

    pub fn gate_mode(&self) -> GateMode {
        GateMode::from_flag(self.use_negative_gates)
    }

    /// Whether the backward pass takes the state-history path.
    pub fn exact_gate_grads(&self) -> bool {
        self.gate_grad.resolve(self.use_negative_gates) == GateGradStrategy::StateHistory
    }

    pub(crate) fn launch_config(&self, dk: usize) -> LaunchConfig {
        LaunchConfig {
            scale: self.resolved_scale(dk),
            reverse: self.reverse,
            gate: self.gate_mode(),
            max_block_k: self.max_block_k,
            max_block_v: self.max_block_v,
        }
    }
}
