//! Block partitioning of the key/value dimensions and masked lane I/O.
//!
//! A dimension of size `dim` is cut into `count` blocks of `size` lanes.
//! The last block may be partial: its lanes past `dim` load as zero and
//! are never stored.

use crate::Acc;

/// Largest block width along either state dimension.
pub const MAX_BLOCK: usize = 64;

/// One block of lanes along a state dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Block index within its layout.
    pub index: usize,
    /// First in-range lane, in dimension coordinates.
    pub start: usize,
    /// Number of in-range lanes.
    pub len: usize,
    /// Lane buffer width (the layout's block size).
    pub width: usize,
}

impl Block {
    /// Whether the block is cut short by the end of the dimension.
    pub fn is_partial(&self) -> bool {
        self.len < self.width
    }

    /// Copy `row[start..start + len]` into `lanes`, zeroing the padding.
    #[inline]
    pub fn load(&self, row: &[Acc], lanes: &mut [Acc]) {
        debug_assert_eq!(lanes.len(), self.width);
        lanes[..self.len].copy_from_slice(&row[self.start..self.start + self.len]);
        lanes[self.len..].fill(0.0);
    }

    /// Like [`Block::load`], multiplying every in-range lane by `scale`.
    #[inline]
    pub fn load_scaled(&self, row: &[Acc], scale: Acc, lanes: &mut [Acc]) {
        debug_assert_eq!(lanes.len(), self.width);
        for (lane, &x) in lanes.iter_mut().zip(&row[self.start..self.start + self.len]) {
            *lane = x * scale;
        }
        lanes[self.len..].fill(0.0);
    }

    /// Write the in-range lanes back to `row[start..start + len]`.
    #[inline]
    pub fn store(&self, lanes: &[Acc], row: &mut [Acc]) {
        row[self.start..self.start + self.len].copy_from_slice(&lanes[..self.len]);
    }
}

/// Partition of one dimension into equally sized blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub dim: usize,
    pub size: usize,
    pub count: usize,
}

impl BlockLayout {
    /// `size = min(dim, max_block)`, `count = ceil(dim / size)`.
    pub fn new(dim: usize, max_block: usize) -> Self {
        assert!(dim >= 1, "state dimension must be at least 1");
        assert!(max_block >= 1, "block size must be at least 1");
        let size = dim.min(max_block);
        Self {
            dim,
            size,
            count: dim.div_ceil(size),
        }
    }

    pub fn block(&self, index: usize) -> Block {
        assert!(index < self.count, "block {index} out of {}", self.count);
        let start = index * self.size;
        Block {
            index,
            start,
            len: self.size.min(self.dim - start),
            width: self.size,
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        (0..self.count).map(move |i| self.block(i))
    }
}

/// Timestep visited at recurrence step `s`.
#[inline]
pub fn time_index(step: usize, t_len: usize, reverse: bool) -> usize {
    if reverse {
        t_len - 1 - step
    } else {
        step
    }
}

/// Timesteps in walk order.
pub fn time_steps(t_len: usize, reverse: bool) -> impl Iterator<Item = usize> {
    (0..t_len).map(move |s| time_index(s, t_len, reverse))
}
