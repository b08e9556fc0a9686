//! Element-wise addition of same-shaped tensors.
//!
//! Math runs in `f64` and the result is narrowed back to the operand dtype.

use crate::error::LiraError;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise `self + other`. The result is detached from the graph.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.dtype() != other.dtype() {
            return Err(LiraError::DTypeMismatch {
                lhs: self.dtype(),
                rhs: other.dtype(),
            });
        }
        if self.shape() != other.shape() {
            return Err(LiraError::ShapeMismatch {
                expected: self.shape().dims().to_vec(),
                got: other.shape().dims().to_vec(),
            });
        }

        let sum: Vec<f64> = self
            .to_f64_vec()
            .iter()
            .zip(other.to_f64_vec())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor::narrow_from_f64(&sum, self.shape().dims(), self.dtype()))
    }
}
