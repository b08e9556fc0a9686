//! Log-gate → multiplicative decay transforms.

use crate::Acc;

/// How a raw log-gate value becomes a decay factor.
///
/// Selected at runtime; both modes share every kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    /// `d(x) = exp(x)`, decay in `(0, ∞)`.
    #[default]
    Standard,
    /// `d(x) = 2·exp(x) − 1`, decay in `(−1, ∞)`.
    Negative,
}

impl GateMode {
    pub fn from_flag(use_negative_gates: bool) -> Self {
        if use_negative_gates {
            GateMode::Negative
        } else {
            GateMode::Standard
        }
    }

    pub fn is_negative(self) -> bool {
        self == GateMode::Negative
    }

    /// Decay factor for log-gate `x`.
    #[inline]
    pub fn decay(self, x: Acc) -> Acc {
        match self {
            GateMode::Standard => x.exp(),
            GateMode::Negative => 2.0 * x.exp() - 1.0,
        }
    }

    /// `d'(x)`.
    #[inline]
    pub fn derivative(self, x: Acc) -> Acc {
        match self {
            GateMode::Standard => x.exp(),
            GateMode::Negative => 2.0 * x.exp(),
        }
    }

    /// Transform a lane buffer of log-gates into decay factors in place.
    ///
    /// Zero-padded lanes map to a factor of one in both modes.
    #[inline]
    pub fn decay_in_place(self, lanes: &mut [Acc]) {
        for x in lanes.iter_mut() {
            *x = self.decay(*x);
        }
    }
}
