//! Reverse-mode gradient graph shared by every LIRA operation.
//!
//! `Tensor` carries an optional `GradNode`; downstream crates record their
//! own `GradFn` implementations on it, so the graph types sit here below
//! the kernels.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::tensor::Tensor;

/// Maps the gradient of an operation's output to gradients of its inputs.
pub trait GradFn: Send + Sync {
    /// One entry per recorded input, in recording order. `None` skips
    /// that input.
    fn apply(&self, grad_output: &Tensor) -> Vec<Option<Tensor>>;

    fn name(&self) -> &str;
}

static NODE_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A vertex of the gradient graph.
///
/// Leaves (tensors with `requires_grad`) have no `grad_fn`. Interior nodes
/// point at their inputs through `Weak` so the graph never keeps a
/// tensor's node alive on its own.
pub struct GradNode {
    pub id: usize,
    pub grad_fn: Option<Box<dyn GradFn>>,
    pub inputs: Vec<Weak<GradNode>>,
    pub grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    pub fn leaf() -> Arc<Self> {
        Self::build(None, Vec::new())
    }

    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Arc<GradNode>>) -> Arc<Self> {
        Self::build(Some(grad_fn), inputs.iter().map(Arc::downgrade).collect())
    }

    fn build(grad_fn: Option<Box<dyn GradFn>>, inputs: Vec<Weak<GradNode>>) -> Arc<Self> {
        Arc::new(Self {
            id: NODE_COUNTER.fetch_add(1, Ordering::Relaxed),
            grad_fn,
            inputs,
            grad: RwLock::new(None),
        })
    }

    /// Add `grad` to the stored gradient.
    ///
    /// The first contribution fixes the stored dtype; later ones are cast
    /// to it.
    ///
    /// # Panics
    ///
    /// If `grad` does not have the shape of the gradient already stored.
    pub fn accumulate_grad(&self, grad: &Tensor) {
        let mut slot = self.grad.write();
        let total = match slot.as_ref() {
            None => grad.detach(),
            Some(existing) => existing
                .add(&grad.to_dtype(existing.dtype()))
                .unwrap_or_else(|e| panic!("gradient accumulation at node {}: {e}", self.id)),
        };
        *slot = Some(total);
    }

    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }
}

/// Seed `root` with `grad_output` and push gradients to every reachable leaf.
///
/// Each node's `GradFn` runs once, after all of its consumers have
/// contributed to its gradient.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) {
    root.accumulate_grad(&grad_output);

    for node in consumers_first(root) {
        let Some(grad_fn) = node.grad_fn.as_ref() else { continue };
        let Some(node_grad) = node.get_grad() else { continue };

        tracing::trace!(node = node.id, grad_fn = grad_fn.name(), "backward step");
        let input_grads = grad_fn.apply(&node_grad);

        for (input, grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input), Some(grad)) = (input.upgrade(), grad) {
                input.accumulate_grad(&grad);
            }
        }
    }
}

/// Nodes reachable from `root`, each listed after all of its consumers.
fn consumers_first(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    // Count in-edges from within the reachable subgraph.
    let mut in_degree: HashMap<usize, usize> = HashMap::new();
    let mut seen: HashMap<usize, Arc<GradNode>> = HashMap::from([(root.id, Arc::clone(root))]);
    let mut frontier = vec![Arc::clone(root)];
    while let Some(node) = frontier.pop() {
        for input in node.inputs.iter().filter_map(Weak::upgrade) {
            *in_degree.entry(input.id).or_default() += 1;
            if !seen.contains_key(&input.id) {
                seen.insert(input.id, Arc::clone(&input));
                frontier.push(input);
            }
        }
    }

    let mut order = Vec::with_capacity(seen.len());
    let mut ready = VecDeque::from([Arc::clone(root)]);
    while let Some(node) = ready.pop_front() {
        for input in node.inputs.iter().filter_map(Weak::upgrade) {
            let remaining = in_degree.get_mut(&input.id).map(|d| {
                *d -= 1;
                *d
            });
            if remaining == Some(0) {
                ready.push_back(input);
            }
        }
        order.push(node);
    }
    order
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations on this thread record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Disables graph recording on the current thread until dropped.
///
/// ```
/// use lira_core::autograd::{is_grad_enabled, NoGradGuard};
///
/// {
///     let _guard = NoGradGuard::new();
///     assert!(!is_grad_enabled());
/// }
/// assert!(is_grad_enabled());
/// ```
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self { prev: GRAD_ENABLED.with(|g| g.replace(false)) }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.prev));
    }
}
