//! Two-level preconditioner: a global coarse correction followed by a
//! local block solve.
//!
//! The coarse space has one piecewise-constant basis function per rank
//! (the indicator of its owned rows), so the coarse operator is the P×P
//! matrix `A0[i][j] = Σ A(r, c)` over rows owned by rank `i` and columns
//! owned by rank `j`. Each rank computes its own row (row split) or column
//! (column split) of `A0`; the root rank gathers, assembles and factors it.
//!
//! One application with right-hand side `b` and iterate `x`:
//!
//! 1. `z ← b − A·x`
//! 2. every rank sums its block of `z`; the sums are gathered on the root
//! 3. the root solves `A0·c = sums` and scatters `c[r]` to rank `r`
//! 4. `x ← x + c[rank]` on every owned entry
//! 5. `z ← b − A·x`
//! 6. `x ← x + M_local⁻¹·z` with the local block preconditioner
//!
//! The transposed application uses `Aᵀ` and `A0ᵀ` throughout.

use crate::config::TwoLevelOptions;
use crate::core::traits::LocalMatrix;
use crate::distributed::{DistMatrix, DistVector, Split};
use crate::error::{KError, Result};
use crate::matrix::SparseRowMatrix;
use crate::preconditioner::{LocalLu, Preconditioner};
use crate::solver::direct_lu::DenseLu;
use faer::Mat;

pub struct TwoLevel<M: LocalMatrix = SparseRowMatrix, P = LocalLu> {
    opts: TwoLevelOptions,
    local: P,
    matrix: Option<DistMatrix<M>>,
    coarse: Option<DenseLu>,
}

impl<M: LocalMatrix, P> TwoLevel<M, P> {
    pub fn new(local: P) -> Self {
        Self::with_options(local, TwoLevelOptions::default())
    }

    pub fn with_options(local: P, opts: TwoLevelOptions) -> Self {
        Self { opts, local, matrix: None, coarse: None }
    }

    /// Rank that owns the coarse system.
    pub fn root(&self) -> usize {
        self.opts.root
    }

    /// Coarse system dimension once set up (root rank only).
    pub fn coarse_dim(&self) -> Option<usize> {
        self.coarse.as_ref().map(DenseLu::dim)
    }

    fn operator(&self) -> Result<&DistMatrix<M>> {
        self.matrix
            .as_ref()
            .ok_or_else(|| KError::InvalidArgument("two-level preconditioner applied before setup".into()))
    }

    /// This rank's row (row split) or column (column split) of `A0`.
    fn coarse_contribution(a: &DistMatrix<M>) -> Vec<f64> {
        let rank = a.channel().rank();
        let mut part = vec![0.0; a.channel().size()];
        a.diagonal_block().for_each_nonzero(|_, _, v| part[rank] += v);
        let (owners, split) = match a.split() {
            Split::Rows => (a.column_ownership(), Split::Rows),
            Split::Columns => (a.row_ownership(), Split::Columns),
        };
        a.off_diagonal_block().for_each_nonzero(|i, j, v| {
            let g = if split == Split::Rows { j } else { i };
            if let Some(p) = owners.owner(g) {
                part[p] += v;
            }
        });
        part
    }
}

impl<M, P> TwoLevel<M, P>
where
    M: LocalMatrix,
    P: Preconditioner<M, [f64]>,
{
    fn coarse_solve(&self, transpose: bool, rhs: &[f64]) -> Result<Vec<f64>> {
        let lu = self
            .coarse
            .as_ref()
            .ok_or_else(|| KError::InvalidArgument("coarse system missing on root".into()))?;
        let mut c = vec![0.0; rhs.len()];
        if transpose {
            lu.solve_transpose(rhs, &mut c)?;
        } else {
            lu.solve(rhs, &mut c)?;
        }
        Ok(c)
    }

    fn correct(&self, transpose: bool, b: &DistVector, x: &mut DistVector) -> Result<()> {
        let a = self.operator()?;
        let comm = a.channel();
        let rank = comm.rank();
        let size = comm.size();
        let root = self.opts.root;

        let mut z = a.row_vector()?;
        a.residual(b, x, &mut z, transpose)?;

        let sum: f64 = z.local().iter().sum();
        let mut sums: Vec<Vec<f64>> = if rank == root { vec![vec![0.0]; size] } else { Vec::new() };
        comm.gather(&[sum], &mut sums, root)?;

        // The root's outcome travels with the scatter so a failed coarse
        // solve fails every rank instead of stranding them.
        let shares: Vec<Vec<Result<f64>>> = if rank == root {
            let rhs: Vec<f64> = sums.into_iter().flatten().collect();
            match self.coarse_solve(transpose, &rhs) {
                Ok(c) => c.into_iter().map(|v| vec![Ok(v)]).collect(),
                Err(e) => vec![vec![Err(e)]; size],
            }
        } else {
            Vec::new()
        };
        let mut share = [Ok(0.0)];
        comm.scatter(&shares, &mut share, root)?;
        let [share] = share;
        let c = share?;
        for v in x.local_mut() {
            *v += c;
        }

        a.residual(b, x, &mut z, transpose)?;
        let mut t = vec![0.0; z.local().len()];
        if transpose {
            self.local.trans_apply(z.local(), &mut t)?;
        } else {
            self.local.apply(z.local(), &mut t)?;
        }
        for (v, dv) in x.local_mut().iter_mut().zip(&t) {
            *v += dv;
        }
        Ok(())
    }
}

impl<M, P> Preconditioner<DistMatrix<M>, DistVector> for TwoLevel<M, P>
where
    M: LocalMatrix,
    P: Preconditioner<M, [f64]>,
{
    /// Collective: assemble and factor the coarse system on the root and
    /// set up the local block preconditioner on every rank.
    fn setup(&mut self, a: &DistMatrix<M>) -> Result<()> {
        let comm = a.channel();
        let rank = comm.rank();
        let size = comm.size();
        let root = self.opts.root;
        let _span = tracing::debug_span!("two_level_setup", rank, root).entered();

        let shape = if root >= size {
            Err(KError::InvalidRank { rank: root, size })
        } else if a.row_ownership() != a.column_ownership() {
            Err(KError::InvalidArgument(
                "two-level preconditioning needs matching row and column blocks".into(),
            ))
        } else {
            Ok(())
        };
        comm.agree(shape)?;

        let part = Self::coarse_contribution(a);
        let mut parts: Vec<Vec<f64>> = if rank == root { vec![vec![0.0; size]; size] } else { Vec::new() };
        comm.gather(&part, &mut parts, root)?;

        let coarse = if rank == root {
            let a0 = match a.split() {
                Split::Rows => Mat::from_fn(size, size, |i, j| parts[i][j]),
                Split::Columns => Mat::from_fn(size, size, |i, j| parts[j][i]),
            };
            DenseLu::factor(&a0).map(Some)
        } else {
            Ok(None)
        };
        let mut status = [coarse.as_ref().err().cloned()];
        comm.broadcast(&mut status, root)?;
        let [status] = status;
        if let Some(e) = status {
            tracing::warn!(error = %e, "coarse factorization failed");
            return Err(e);
        }
        let coarse = coarse?;

        comm.agree(self.local.setup(a.diagonal_block()))?;
        tracing::debug!(coarse_dim = size, "two-level preconditioner ready");

        self.coarse = coarse;
        self.matrix = Some(a.clone());
        Ok(())
    }

    fn apply(&self, b: &DistVector, x: &mut DistVector) -> Result<()> {
        self.correct(false, b, x)
    }

    fn trans_apply(&self, b: &DistVector, x: &mut DistVector) -> Result<()> {
        self.correct(true, b, x)
    }
}
