use smallvec::SmallVec;
use std::fmt;

/// Row-major extents of a tensor.
///
/// Recurrence operands are rank 2 to 4 (`[B*H, T]` up to `[B, H, T, D]`),
/// so four inline slots cover every case without a heap allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: SmallVec::from_slice(dims) }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Element count; an empty dimension list counts as one element.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Element count of everything before the trailing `keep` axes.
    ///
    /// `[B, H, T, D].leading_numel(2)` is `B * H`. `None` when the shape
    /// has fewer than `keep` axes.
    pub fn leading_numel(&self, keep: usize) -> Option<usize> {
        let split = self.ndim().checked_sub(keep)?;
        Some(self.dims[..split].iter().product())
    }

    /// Resolve a reshape target against this shape's element count.
    ///
    /// One axis may be `-1` and is filled in from the rest. Any other
    /// negative extent, a second `-1`, or a count mismatch yields `None`.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut free_axis = None;
        let mut dims: SmallVec<[usize; 4]> = SmallVec::with_capacity(target.len());

        for (axis, &extent) in target.iter().enumerate() {
            match extent {
                -1 if free_axis.is_none() => {
                    free_axis = Some(axis);
                    dims.push(1);
                }
                e if e >= 0 => dims.push(e as usize),
                _ => return None,
            }
        }

        let fixed = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))?;
        if let Some(axis) = free_axis {
            if fixed == 0 || numel % fixed != 0 {
                return None;
            }
            dims[axis] = numel / fixed;
        } else if fixed != numel {
            return None;
        }
        Some(Shape { dims })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}
