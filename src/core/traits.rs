//! Core linear-algebra traits for vmpi.

use crate::error::Result;

/// Local (per-rank) matrix storage capability.
///
/// This is everything the distributed layer needs from a local block:
/// entry access, products, and a walk over the stored non-zeros.
pub trait LocalMatrix: Clone + Send + Sync {
    /// Number of rows.
    fn nrows(&self) -> usize;
    /// Number of columns.
    fn ncols(&self) -> usize;
    /// Entry (i, j); zero if not stored.
    fn get(&self, i: usize, j: usize) -> f64;
    /// Overwrite entry (i, j).
    fn set(&mut self, i: usize, j: usize, value: f64);
    /// Accumulate into entry (i, j).
    fn add(&mut self, i: usize, j: usize, value: f64);
    /// y ← y + α·A·x
    fn mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]);
    /// y ← y + α·Aᵀ·x
    fn trans_mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]);
    /// Visit every stored non-zero as (row, column, value).
    fn for_each_nonzero<F: FnMut(usize, usize, f64)>(&self, f: F);
    /// Replace every stored non-zero with `f(row, column, value)`.
    fn map_nonzeros<F: FnMut(usize, usize, f64) -> f64>(&mut self, f: F);
    /// Set every entry to zero.
    fn zero(&mut self);

    /// y ← A·x
    fn multiply(&self, x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
        self.mult_add(1.0, x, y);
    }

    /// y ← Aᵀ·x
    fn trans_multiply(&self, x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
        self.trans_mult_add(1.0, x, y);
    }
}

/// A matrix seen only through its action on vectors.
pub trait LinearOperator<V> {
    /// y ← A·x
    fn multiply(&self, x: &V, y: &mut V) -> Result<()>;
    /// y ← Aᵀ·x
    fn transpose_multiply(&self, x: &V, y: &mut V) -> Result<()>;
}
