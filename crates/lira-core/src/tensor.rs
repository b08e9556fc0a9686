use std::fmt;
use std::sync::Arc;

use crate::autograd::GradNode;
use crate::dtype::DType;
use crate::element::FloatElement;
use crate::error::LiraError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A dense, row-major, multi-dimensional array.
///
/// Tensors support:
/// - F16 / BF16 / F32 / F64 element types over shared byte storage
/// - Zero-copy reshapes (views share storage)
/// - Widening to `f64` for kernels, narrowing back for results
/// - Automatic gradient tracking through `GradNode`
///
/// # Examples
///
/// ```
/// use lira_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.shape().dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from typed host data with the given shape.
    pub fn from_slice<T: FloatElement>(data: &[T], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_slice(data), shape)
    }

    /// Create a tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_slice(data, shape)
    }

    /// Create a tensor from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        Self::from_slice(data, shape)
    }

    /// Create a tensor of `dtype` from accumulation-precision values.
    ///
    /// Values are rounded to the nearest representable element.
    pub fn narrow_from_f64(data: &[f64], shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::narrow_from_f64(data, dtype), shape)
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(dtype, s.numel()), shape)
    }

    /// F64 tensor drawn uniformly from `[low, high)` with a fixed seed.
    pub fn rand_uniform_seeded(shape: &[usize], low: f64, high: f64, seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        let s = Shape::new(shape);
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let data: Vec<f64> = (0..s.numel()).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f64(&data, shape)
    }

    fn from_storage(storage: Storage, shape: &[usize]) -> Self {
        Self {
            storage,
            shape: Shape::new(shape),
            requires_grad: false,
            grad_node: None,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Whether this tensor requires gradient computation.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set whether this tensor requires gradient computation.
    /// When enabled, creates a leaf GradNode for this tensor.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    /// Get the GradNode for this tensor (if tracking gradients).
    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a GradNode to this tensor (used by op dispatch).
    /// Also sets requires_grad=true since this tensor is part of the computation graph.
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// A copy sharing storage but detached from the graph.
    pub fn detach(&self) -> Tensor {
        Tensor {
            storage: self.storage.clone(),
            shape: self.shape.clone(),
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Get the accumulated gradient for this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    /// Check if any input requires grad (used by op dispatch to decide whether to build graph).
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && crate::autograd::is_grad_enabled()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Get the underlying f32 data as a slice.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_f32_slice()
    }

    /// Get the underlying f64 data as a slice.
    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        self.storage.as_f64_slice()
    }

    /// Get a single element by flat index, widened to f64.
    pub fn get_f64(&self, flat_index: usize) -> Option<f64> {
        self.storage.get_f64(flat_index)
    }

    /// Copy all elements into a `Vec<f64>` (widening).
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.storage.to_f64_vec()
    }

    /// Convert to another dtype. No-op (shared storage) if already there.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if self.dtype() == dtype {
            return self.detach();
        }
        Tensor::narrow_from_f64(&self.to_f64_vec(), self.shape.dims(), dtype)
    }

    // =========================================================================
    // Shape operations (zero-copy views)
    // =========================================================================

    /// Reshape the tensor (zero-copy).
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            LiraError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.iter().map(|&d| d as usize).collect(),
            }
        })?;

        Ok(Tensor {
            storage: self.storage.clone(), // Arc clone, shared data
            shape: resolved,
            requires_grad: self.requires_grad,
            grad_node: self.grad_node.clone(),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.requires_grad,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.numel();
        if n <= 20 {
            write!(f, "tensor({:?}, shape={})", self.to_f64_vec(), self.shape)
        } else {
            let at = |i: usize| self.get_f64(i).unwrap_or(f64::NAN);
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                at(0),
                at(1),
                at(n - 1),
                self.shape
            )
        }
    }
}
