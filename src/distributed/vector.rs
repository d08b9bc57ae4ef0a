//! Vectors partitioned in contiguous blocks across the ranks of a channel.

use crate::distributed::ownership::Ownership;
use crate::error::{KError, Result};
use crate::parallel::{Channel, ReduceOp};
use std::sync::Arc;

/// A global vector of which each rank stores one contiguous block.
///
/// Cloning copies the local block only; clones share the channel and the
/// ownership table, so they can be combined without communication.
#[derive(Debug, Clone)]
pub struct DistVector {
    comm: Arc<Channel>,
    owners: Arc<Ownership>,
    local: Vec<f64>,
}

impl DistVector {
    /// Collective: wrap this rank's block of a vector of global length `size`.
    ///
    /// Fails on every rank when the local lengths do not add up to `size`.
    pub fn new(size: usize, comm: Arc<Channel>, local: Vec<f64>) -> Result<Self> {
        let owners = Ownership::gather(&comm, local.len())?;
        owners.expect_size(size)?;
        Ok(Self { comm, owners: Arc::new(owners), local })
    }

    /// Collective: zero vector of global length `size` with `local_len`
    /// entries on this rank.
    pub fn zeros(size: usize, comm: Arc<Channel>, local_len: usize) -> Result<Self> {
        Self::new(size, comm, vec![0.0; local_len])
    }

    /// Zero vector over an existing ownership table. No communication.
    pub fn with_ownership(comm: Arc<Channel>, owners: Arc<Ownership>) -> Result<Self> {
        if owners.ranks() != comm.size() {
            return Err(KError::SizeMismatch { expected: comm.size(), actual: owners.ranks() });
        }
        let local = vec![0.0; owners.local_len(comm.rank())];
        Ok(Self { comm, owners, local })
    }

    /// Collective: take this rank's block of a replicated global vector.
    pub fn from_global(comm: Arc<Channel>, global: &[f64], local_len: usize) -> Result<Self> {
        let owners = Ownership::gather(&comm, local_len)?;
        owners.expect_size(global.len())?;
        let local = global[owners.range(comm.rank())].to_vec();
        Ok(Self { comm, owners: Arc::new(owners), local })
    }

    /// Global length.
    pub fn size(&self) -> usize {
        self.owners.size()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.comm
    }

    pub fn ownership(&self) -> &Arc<Ownership> {
        &self.owners
    }

    /// First global index owned by this rank.
    pub fn start(&self) -> usize {
        self.owners.start(self.comm.rank())
    }

    /// One past the last global index owned by this rank.
    pub fn end(&self) -> usize {
        self.owners.end(self.comm.rank())
    }

    pub fn local(&self) -> &[f64] {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut [f64] {
        &mut self.local
    }

    fn local_pos(&self, index: usize) -> Result<usize> {
        self.owners.to_local(self.comm.rank(), index)
    }

    /// Read a locally owned entry by global index.
    pub fn get(&self, index: usize) -> Result<f64> {
        Ok(self.local[self.local_pos(index)?])
    }

    /// Overwrite a locally owned entry by global index.
    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        let i = self.local_pos(index)?;
        self.local[i] = value;
        Ok(())
    }

    /// Add to a locally owned entry by global index.
    pub fn add(&mut self, index: usize, value: f64) -> Result<()> {
        let i = self.local_pos(index)?;
        self.local[i] += value;
        Ok(())
    }

    /// Fail unless `other` is distributed exactly like `self`.
    pub fn check_compatible(&self, other: &DistVector) -> Result<()> {
        if Arc::ptr_eq(&self.owners, &other.owners) || self.owners == other.owners {
            Ok(())
        } else {
            Err(KError::SizeMismatch { expected: self.size(), actual: other.size() })
        }
    }

    pub fn zero(&mut self) {
        self.local.fill(0.0);
    }

    pub fn fill(&mut self, value: f64) {
        self.local.fill(value);
    }

    /// `self ← other`.
    pub fn copy_from(&mut self, other: &DistVector) -> Result<()> {
        self.check_compatible(other)?;
        self.local.copy_from_slice(&other.local);
        Ok(())
    }

    /// `self ← alpha * self`.
    pub fn scale(&mut self, alpha: f64) {
        for v in &mut self.local {
            *v *= alpha;
        }
    }

    /// `self ← self + alpha * x`.
    pub fn axpy(&mut self, alpha: f64, x: &DistVector) -> Result<()> {
        self.check_compatible(x)?;
        for (y, &xi) in self.local.iter_mut().zip(&x.local) {
            *y += alpha * xi;
        }
        Ok(())
    }

    /// `self ← x + beta * self`.
    pub fn aypx(&mut self, beta: f64, x: &DistVector) -> Result<()> {
        self.check_compatible(x)?;
        for (y, &xi) in self.local.iter_mut().zip(&x.local) {
            *y = xi + beta * *y;
        }
        Ok(())
    }

    /// Collective inner product.
    pub fn dot(&self, other: &DistVector) -> Result<f64> {
        self.check_compatible(other)?;
        let partial: f64 = self.local.iter().zip(&other.local).map(|(a, b)| a * b).sum();
        self.comm.all_reduce_scalar(partial, ReduceOp::Sum)
    }

    /// Collective sum of absolute values.
    pub fn norm1(&self) -> Result<f64> {
        let partial: f64 = self.local.iter().map(|v| v.abs()).sum();
        self.comm.all_reduce_scalar(partial, ReduceOp::Sum)
    }

    /// Collective Euclidean norm.
    pub fn norm2(&self) -> Result<f64> {
        let partial: f64 = self.local.iter().map(|v| v * v).sum();
        Ok(self.comm.all_reduce_scalar(partial, ReduceOp::Sum)?.sqrt())
    }

    /// Collective maximum absolute value. NaN if any entry is NaN.
    pub fn norm_inf(&self) -> Result<f64> {
        let partial = self
            .local
            .iter()
            .fold(0.0f64, |m, v| if m.is_nan() || v.is_nan() { f64::NAN } else { m.max(v.abs()) });
        self.comm.all_reduce_scalar(partial, ReduceOp::Max)
    }

    /// Collective sum of all entries.
    pub fn sum(&self) -> Result<f64> {
        let partial: f64 = self.local.iter().sum();
        self.comm.all_reduce_scalar(partial, ReduceOp::Sum)
    }

    /// Collective: assemble the global vector on `root`; other ranks get
    /// `None`.
    pub fn gather_to(&self, root: usize) -> Result<Option<Vec<f64>>> {
        let rank = self.comm.rank();
        let mut parts: Vec<Vec<f64>> = if rank == root {
            (0..self.owners.ranks()).map(|r| vec![0.0; self.owners.local_len(r)]).collect()
        } else {
            Vec::new()
        };
        self.comm.gather(&self.local, &mut parts, root)?;
        Ok((rank == root).then(|| parts.concat()))
    }

    /// Collective: assemble the global vector on every rank.
    pub fn all_gather(&self) -> Result<Vec<f64>> {
        let mut parts: Vec<Vec<f64>> =
            (0..self.owners.ranks()).map(|r| vec![0.0; self.owners.local_len(r)]).collect();
        self.comm.all_gather(&self.local, &mut parts)?;
        Ok(parts.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::run;
    use approx::assert_relative_eq;

    #[test]
    fn blocks_must_cover_global_size() {
        let results = run(2, |ch| DistVector::zeros(5, ch, 2).map(|_| ())).unwrap();
        for r in results {
            assert_eq!(r, Err(KError::SizeMismatch { expected: 5, actual: 4 }));
        }
    }

    #[test]
    fn entry_access_is_local_only() {
        let results = run(2, |ch| {
            let mut v = DistVector::zeros(4, ch, 2).unwrap();
            let mine = v.start();
            v.set(mine, 3.0).unwrap();
            v.add(mine, 1.5).unwrap();
            let other = (mine + 2) % 4;
            (v.get(mine), v.set(other, 1.0))
        })
        .unwrap();
        assert_eq!(results[0].0, Ok(4.5));
        assert_eq!(results[0].1, Err(KError::NotLocal { index: 2, start: 0, end: 2 }));
        assert_eq!(results[1].1, Err(KError::NotLocal { index: 0, start: 2, end: 4 }));
    }

    #[test]
    fn reductions_match_serial() {
        let global: Vec<f64> = (0..7).map(|i| i as f64 - 3.0).collect();
        let sizes = [3, 0, 4];
        let results = run(3, |ch| {
            let v = DistVector::from_global(ch.clone(), &global, sizes[ch.rank()]).unwrap();
            let mut w = v.clone();
            w.scale(2.0);
            w.axpy(-1.0, &v).unwrap();
            (v.dot(&w).unwrap(), v.norm1().unwrap(), v.norm2().unwrap(), v.norm_inf().unwrap())
        })
        .unwrap();
        let dot: f64 = global.iter().map(|x| x * x).sum();
        let n1: f64 = global.iter().map(|x| x.abs()).sum();
        for (d, a, b, c) in results {
            assert_relative_eq!(d, dot);
            assert_relative_eq!(a, n1);
            assert_relative_eq!(b, dot.sqrt());
            assert_relative_eq!(c, 3.0);
        }
    }

    #[test]
    fn nan_reaches_every_rank_through_norm_inf() {
        let results = run(3, |ch| {
            let mut v = DistVector::zeros(3, Arc::clone(&ch), 1).unwrap();
            v.fill(if ch.rank() == 1 { f64::NAN } else { 5.0 });
            v.norm_inf().unwrap()
        })
        .unwrap();
        assert!(results.iter().all(|n| n.is_nan()));
    }

    #[test]
    fn gather_reassembles_on_root() {
        let global = [1.0, 2.0, 3.0, 4.0, 5.0];
        let results = run(2, |ch| {
            let len = if ch.rank() == 0 { 2 } else { 3 };
            let v = DistVector::from_global(ch, &global, len).unwrap();
            (v.gather_to(1).unwrap(), v.all_gather().unwrap())
        })
        .unwrap();
        assert_eq!(results[0].0, None);
        assert_eq!(results[1].0.as_deref(), Some(&global[..]));
        assert_eq!(results[0].1, global.to_vec());
    }
}
