//! Contiguous ownership of a global index range across ranks.

use crate::error::{KError, Result};
use crate::parallel::Channel;
use std::ops::Range;

/// `offsets[r]` is the first global index owned by rank `r`;
/// `offsets[P]` is the global size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    offsets: Vec<usize>,
}

impl Ownership {
    /// Prefix-sum per-rank sizes into an ownership table.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0);
        let mut acc = 0;
        for &s in sizes {
            acc += s;
            offsets.push(acc);
        }
        Self { offsets }
    }

    /// Collective: all-gather every rank's local size and prefix-sum.
    pub fn gather(comm: &Channel, local_len: usize) -> Result<Self> {
        let sizes = comm.all_gather_scalar(local_len)?;
        Ok(Self::from_sizes(&sizes))
    }

    /// Fail unless the table covers exactly `global` indices.
    pub fn expect_size(&self, global: usize) -> Result<()> {
        if self.size() == global {
            Ok(())
        } else {
            Err(KError::SizeMismatch { expected: global, actual: self.size() })
        }
    }

    /// Global size.
    pub fn size(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    /// Number of ranks.
    pub fn ranks(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn start(&self, rank: usize) -> usize {
        self.offsets[rank]
    }

    pub fn end(&self, rank: usize) -> usize {
        self.offsets[rank + 1]
    }

    pub fn range(&self, rank: usize) -> Range<usize> {
        self.start(rank)..self.end(rank)
    }

    pub fn local_len(&self, rank: usize) -> usize {
        self.end(rank) - self.start(rank)
    }

    /// Rank owning `global`, or `None` when out of range.
    pub fn owner(&self, global: usize) -> Option<usize> {
        if global >= self.size() {
            return None;
        }
        Some(self.offsets.partition_point(|&o| o <= global) - 1)
    }

    /// Local position of `global` on `rank`.
    pub fn to_local(&self, rank: usize, global: usize) -> Result<usize> {
        let range = self.range(rank);
        if range.contains(&global) {
            Ok(global - range.start)
        } else {
            Err(KError::NotLocal { index: global, start: range.start, end: range.end })
        }
    }
}
