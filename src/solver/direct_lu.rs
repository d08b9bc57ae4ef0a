//! Dense direct solves using Faer's fully pivoted LU.
//!
//! Used for the coarse systems of two-level preconditioners and for exact
//! solves on small local blocks.

use crate::error::{KError, Result};
use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, Mat, MatMut};

/// LU factorization (full pivoting) of a square dense matrix.
pub struct DenseLu {
    n: usize,
    factor: FullPivLu<f64>,
}

impl std::fmt::Debug for DenseLu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseLu").field("n", &self.n).finish()
    }
}

impl DenseLu {
    /// Factor `a`.
    ///
    /// Fails with [`KError::NotSolvable`] when `a` is singular to working
    /// precision, i.e. some pivot of `U` satisfies
    /// `|u_kk| <= n·ε·max_j |u_jj|`. Ill-conditioned but nonsingular
    /// matrices are accepted.
    pub fn factor(a: &Mat<f64>) -> Result<Self> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(KError::InvalidArgument(format!(
                "LU needs a square matrix, got {}x{}",
                n,
                a.ncols()
            )));
        }
        for j in 0..n {
            for i in 0..n {
                if !a[(i, j)].is_finite() {
                    return Err(KError::FactorError(format!("non-finite entry at ({i}, {j})")));
                }
            }
        }
        let lu = Self { n, factor: FullPivLu::new(a.as_ref()) };
        lu.check_pivots()?;
        Ok(lu)
    }

    fn check_pivots(&self) -> Result<()> {
        let u = self.factor.U();
        let pivots: Vec<f64> = (0..self.n).map(|k| u[(k, k)].abs()).collect();
        if let Some(k) = pivots.iter().position(|p| !p.is_finite()) {
            return Err(KError::FactorError(format!("non-finite pivot at {k}")));
        }
        let largest = pivots.iter().fold(0.0f64, |m, &p| m.max(p));
        let tol = self.n as f64 * f64::EPSILON * largest;
        match pivots.iter().position(|&p| p <= tol) {
            Some(k) => Err(KError::NotSolvable(format!(
                "matrix is singular (pivot {k} is {:.3e}, tolerance {tol:.3e})",
                pivots[k]
            ))),
            None => Ok(()),
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// `x ← A⁻¹·b`.
    pub fn solve(&self, b: &[f64], x: &mut [f64]) -> Result<()> {
        self.solve_with(false, b, x)
    }

    /// `x ← A⁻ᵀ·b`.
    pub fn solve_transpose(&self, b: &[f64], x: &mut [f64]) -> Result<()> {
        self.solve_with(true, b, x)
    }

    fn solve_with(&self, transpose: bool, b: &[f64], x: &mut [f64]) -> Result<()> {
        for len in [b.len(), x.len()] {
            if len != self.n {
                return Err(KError::SizeMismatch { expected: self.n, actual: len });
            }
        }
        if self.n == 0 {
            return Ok(());
        }
        x.copy_from_slice(b);
        let x_mat = MatMut::from_column_major_slice_mut(x, self.n, 1);
        if transpose {
            self.factor.solve_transpose_in_place_with_conj(Conj::No, x_mat);
        } else {
            self.factor.solve_in_place_with_conj(Conj::No, x_mat);
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(KError::NotSolvable("LU solve produced non-finite values".into()));
        }
        Ok(())
    }
}
