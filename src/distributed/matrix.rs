//! Block-distributed matrices.
//!
//! A [`DistMatrix`] is split either by rows or by columns. Each rank stores
//! its slice as two local matrices:
//!
//! * `diag`: the square-ish block where the rank owns both the row and the
//!   column, indexed locally;
//! * `off`: everything else in the slice. For a row split its columns are
//!   global, for a column split its rows are.
//!
//! The non-zero pattern of `off` is fixed at construction: it determines the
//! [`HaloExchange`] over which products communicate.
//!
//! Products follow from the duality between the two splits. A row-split
//! `A·x` and a column-split `Aᵀ·x` scatter owned values into ghosts; a
//! column-split `A·x` and a row-split `Aᵀ·x` gather partial sums back to
//! owners. Either way the local `diag` product overlaps the communication.

use crate::core::traits::{LinearOperator, LocalMatrix};
use crate::distributed::halo::HaloExchange;
use crate::distributed::ownership::Ownership;
use crate::distributed::vector::DistVector;
use crate::error::{KError, Result};
use crate::matrix::SparseRowMatrix;
use crate::parallel::Channel;
use std::sync::Arc;

/// How a matrix is partitioned across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    /// Each rank owns a contiguous block of rows.
    Rows,
    /// Each rank owns a contiguous block of columns.
    Columns,
}

#[derive(Debug, Clone)]
pub struct DistMatrix<M: LocalMatrix = SparseRowMatrix> {
    split: Split,
    comm: Arc<Channel>,
    rows: Arc<Ownership>,
    cols: Arc<Ownership>,
    diag: M,
    off: M,
    halo: HaloExchange,
}

impl<M: LocalMatrix> DistMatrix<M> {
    /// Collective: assemble a row-split `nrows × ncols` matrix.
    ///
    /// `diag` is `local_rows × local_cols`, where `local_cols` is the width
    /// of this rank's column block; `off` is `local_rows × ncols` and must not
    /// store entries in this rank's column block.
    pub fn row_split(nrows: usize, ncols: usize, comm: Arc<Channel>, diag: M, off: M) -> Result<Self> {
        Self::assemble(Split::Rows, nrows, ncols, comm, diag, off)
    }

    /// Collective: assemble a column-split `nrows × ncols` matrix.
    ///
    /// `diag` is `local_rows × local_cols`; `off` is `nrows × local_cols` and
    /// must not store entries in this rank's row block.
    pub fn column_split(nrows: usize, ncols: usize, comm: Arc<Channel>, diag: M, off: M) -> Result<Self> {
        Self::assemble(Split::Columns, nrows, ncols, comm, diag, off)
    }

    fn assemble(split: Split, nrows: usize, ncols: usize, comm: Arc<Channel>, diag: M, off: M) -> Result<Self> {
        let rank = comm.rank();
        let _span = tracing::debug_span!("dist_matrix", rank, ?split, nrows, ncols).entered();

        let (off_rows, off_cols) = match split {
            Split::Rows => (diag.nrows(), ncols),
            Split::Columns => (nrows, diag.ncols()),
        };
        let shape = if off.nrows() != off_rows || off.ncols() != off_cols {
            Err(KError::InvalidArgument(format!(
                "off-diagonal block is {}x{}, expected {off_rows}x{off_cols}",
                off.nrows(),
                off.ncols()
            )))
        } else {
            Ok(())
        };
        comm.agree(shape)?;

        let mut sizes = vec![vec![0usize; 2]; comm.size()];
        comm.all_gather(&[diag.nrows(), diag.ncols()], &mut sizes)?;
        let rows = Ownership::from_sizes(&sizes.iter().map(|s| s[0]).collect::<Vec<_>>());
        let cols = Ownership::from_sizes(&sizes.iter().map(|s| s[1]).collect::<Vec<_>>());
        comm.agree(rows.expect_size(nrows).and_then(|()| cols.expect_size(ncols)))?;

        // Off-block entries inside the local diagonal block would be lost
        // from the halo pattern and double counted by the products.
        let (halo_owners, local) = match split {
            Split::Rows => (&cols, cols.range(rank)),
            Split::Columns => (&rows, rows.range(rank)),
        };
        let mut referenced = Vec::new();
        let mut misplaced = None;
        off.for_each_nonzero(|i, j, _| {
            let g = if split == Split::Rows { j } else { i };
            if local.contains(&g) {
                misplaced.get_or_insert((i, j));
            } else {
                referenced.push(g);
            }
        });
        let pattern = match misplaced {
            Some((i, j)) => Err(KError::InvalidArgument(format!(
                "off-diagonal entry ({i}, {j}) lies in the diagonal block of rank {rank}"
            ))),
            None => Ok(()),
        };
        comm.agree(pattern)?;

        let halo = HaloExchange::build(Arc::clone(&comm), halo_owners, referenced)?;
        Ok(Self {
            split,
            comm,
            rows: Arc::new(rows),
            cols: Arc::new(cols),
            diag,
            off,
            halo,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn nrows(&self) -> usize {
        self.rows.size()
    }

    pub fn ncols(&self) -> usize {
        self.cols.size()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.comm
    }

    pub fn row_ownership(&self) -> &Arc<Ownership> {
        &self.rows
    }

    pub fn column_ownership(&self) -> &Arc<Ownership> {
        &self.cols
    }

    pub fn diagonal_block(&self) -> &M {
        &self.diag
    }

    pub fn off_diagonal_block(&self) -> &M {
        &self.off
    }

    pub fn halo(&self) -> &HaloExchange {
        &self.halo
    }

    /// Zero vector distributed like the rows (the range of `A·x`).
    pub fn row_vector(&self) -> Result<DistVector> {
        DistVector::with_ownership(Arc::clone(&self.comm), Arc::clone(&self.rows))
    }

    /// Zero vector distributed like the columns (the domain of `A·x`).
    pub fn column_vector(&self) -> Result<DistVector> {
        DistVector::with_ownership(Arc::clone(&self.comm), Arc::clone(&self.cols))
    }

    // ---- entry access ----

    fn check_global(&self, i: usize, j: usize) -> Result<()> {
        if i >= self.nrows() || j >= self.ncols() {
            return Err(KError::InvalidArgument(format!(
                "entry ({i}, {j}) outside {}x{}",
                self.nrows(),
                self.ncols()
            )));
        }
        Ok(())
    }

    /// Resolve global `(i, j)` to a local position: `Ok((true, r, c))` for
    /// the diagonal block, `Ok((false, r, c))` for the off-diagonal one.
    fn locate(&self, i: usize, j: usize) -> Result<(bool, usize, usize)> {
        self.check_global(i, j)?;
        let rank = self.comm.rank();
        match self.split {
            Split::Rows => {
                let r = self.rows.to_local(rank, i)?;
                match self.cols.to_local(rank, j) {
                    Ok(c) => Ok((true, r, c)),
                    Err(_) => Ok((false, r, j)),
                }
            }
            Split::Columns => {
                let c = self.cols.to_local(rank, j)?;
                match self.rows.to_local(rank, i) {
                    Ok(r) => Ok((true, r, c)),
                    Err(_) => Ok((false, i, c)),
                }
            }
        }
    }

    fn check_pattern(&self, i: usize, j: usize) -> Result<()> {
        let ghost = if self.split == Split::Rows { j } else { i };
        match self.halo.slot(ghost) {
            Some(_) => Ok(()),
            None => Err(KError::NotInPattern { index: ghost }),
        }
    }

    /// Read entry `(i, j)`; the row (row split) or column (column split)
    /// must be owned here.
    pub fn get(&self, i: usize, j: usize) -> Result<f64> {
        Ok(match self.locate(i, j)? {
            (true, r, c) => self.diag.get(r, c),
            (false, r, c) => self.off.get(r, c),
        })
    }

    /// Overwrite entry `(i, j)`. Off-diagonal writes must stay inside the
    /// communication pattern fixed at construction.
    pub fn set(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        match self.locate(i, j)? {
            (true, r, c) => self.diag.set(r, c, value),
            (false, r, c) => {
                self.check_pattern(i, j)?;
                self.off.set(r, c, value);
            }
        }
        Ok(())
    }

    /// Accumulate into entry `(i, j)`; same ownership rules as [`set`](Self::set).
    pub fn add(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        match self.locate(i, j)? {
            (true, r, c) => self.diag.add(r, c, value),
            (false, r, c) => {
                self.check_pattern(i, j)?;
                self.off.add(r, c, value);
            }
        }
        Ok(())
    }

    /// Zero every stored entry, keeping the pattern.
    pub fn zero(&mut self) {
        self.diag.zero();
        self.off.zero();
    }

    /// `A ← alpha·A`. Local only.
    pub fn scale(&mut self, alpha: f64) {
        self.diag.map_nonzeros(|_, _, v| alpha * v);
        self.off.map_nonzeros(|_, _, v| alpha * v);
    }

    // ---- products ----

    fn check_operands(&self, x: &DistVector, x_owners: &Ownership, y: &DistVector, y_owners: &Ownership) -> Result<()> {
        if **x.ownership() != *x_owners {
            return Err(KError::SizeMismatch { expected: x_owners.size(), actual: x.size() });
        }
        if **y.ownership() != *y_owners {
            return Err(KError::SizeMismatch { expected: y_owners.size(), actual: y.size() });
        }
        Ok(())
    }

    /// Push owned `x` entries into ghosts, multiply `diag` meanwhile, then
    /// apply `off` against the ghosts.
    fn product_scatter(&self, transpose: bool, x: &[f64], y: &mut [f64]) -> Result<()> {
        let pending = self.halo.start_scatter(x)?;
        if transpose {
            self.diag.trans_multiply(x, y);
        } else {
            self.diag.multiply(x, y);
        }
        let mut ghost = vec![0.0; self.halo.ghost_len()];
        self.halo.end_set_scatter(pending, &mut ghost)?;
        let halo = &self.halo;
        let rows_global = self.split == Split::Columns;
        self.off.for_each_nonzero(|i, j, v| {
            // (local, ghost) in the orientation of the product
            let (out, g) = if rows_global { (j, i) } else { (i, j) };
            if let Some(s) = halo.slot(g) {
                y[out] += v * ghost[s];
            }
        });
        Ok(())
    }

    /// Form partial sums for ghosts from `off`, push them to their owners,
    /// multiply `diag` meanwhile, then accumulate what arrives.
    fn product_gather(&self, transpose: bool, x: &[f64], y: &mut [f64]) -> Result<()> {
        let mut partial = vec![0.0; self.halo.ghost_len()];
        let halo = &self.halo;
        let rows_global = self.split == Split::Columns;
        self.off.for_each_nonzero(|i, j, v| {
            let (input, g) = if rows_global { (j, i) } else { (i, j) };
            if let Some(s) = halo.slot(g) {
                partial[s] += v * x[input];
            }
        });
        let pending = self.halo.start_gather(&partial)?;
        if transpose {
            self.diag.trans_multiply(x, y);
        } else {
            self.diag.multiply(x, y);
        }
        self.halo.end_add_gather(pending, y)
    }

    /// Collective `y ← A·x`; `x` is distributed like the columns, `y` like
    /// the rows.
    pub fn multiply(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        self.check_operands(x, &self.cols, y, &self.rows)?;
        match self.split {
            Split::Rows => self.product_scatter(false, x.local(), y.local_mut()),
            Split::Columns => self.product_gather(false, x.local(), y.local_mut()),
        }
    }

    /// Collective `y ← Aᵀ·x`; `x` is distributed like the rows, `y` like
    /// the columns.
    pub fn transpose_multiply(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        self.check_operands(x, &self.rows, y, &self.cols)?;
        match self.split {
            Split::Rows => self.product_gather(true, x.local(), y.local_mut()),
            Split::Columns => self.product_scatter(true, x.local(), y.local_mut()),
        }
    }

    /// Collective `r ← b − A·x` (or `b − Aᵀ·x`).
    pub fn residual(&self, b: &DistVector, x: &DistVector, r: &mut DistVector, transpose: bool) -> Result<()> {
        if transpose {
            self.transpose_multiply(x, r)?;
        } else {
            self.multiply(x, r)?;
        }
        r.aypx(-1.0, b)
    }
}

impl<M: LocalMatrix> LinearOperator<DistVector> for DistMatrix<M> {
    fn multiply(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        DistMatrix::multiply(self, x, y)
    }

    fn transpose_multiply(&self, x: &DistVector, y: &mut DistVector) -> Result<()> {
        DistMatrix::transpose_multiply(self, x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::run;

    // 4x4 tridiagonal [-1 2 -1] over 2 ranks, rows (or columns) 0..2 and 2..4.
    fn tridiag(ch: &Arc<Channel>, split: Split) -> DistMatrix {
        let r = ch.rank();
        let mut diag = SparseRowMatrix::new(2, 2);
        diag.set(0, 0, 2.0);
        diag.set(1, 1, 2.0);
        diag.set(0, 1, -1.0);
        diag.set(1, 0, -1.0);
        let off = match split {
            Split::Rows => {
                let mut off = SparseRowMatrix::new(2, 4);
                if r == 0 { off.set(1, 2, -1.0) } else { off.set(0, 1, -1.0) }
                off
            }
            Split::Columns => {
                let mut off = SparseRowMatrix::new(4, 2);
                if r == 0 { off.set(2, 1, -1.0) } else { off.set(1, 0, -1.0) }
                off
            }
        };
        match split {
            Split::Rows => DistMatrix::row_split(4, 4, Arc::clone(ch), diag, off).unwrap(),
            Split::Columns => DistMatrix::column_split(4, 4, Arc::clone(ch), diag, off).unwrap(),
        }
    }

    #[test]
    fn products_agree_across_splits() {
        let x = [1.0, 2.0, 4.0, 8.0];
        let expected = [0.0, -1.0, -2.0, 12.0];
        for split in [Split::Rows, Split::Columns] {
            let results = run(2, |ch| {
                let a = tridiag(&ch, split);
                let xv = DistVector::from_global(Arc::clone(&ch), &x, 2).unwrap();
                let mut y = a.row_vector().unwrap();
                a.multiply(&xv, &mut y).unwrap();
                let mut yt = a.column_vector().unwrap();
                a.transpose_multiply(&xv, &mut yt).unwrap();
                (y.all_gather().unwrap(), yt.all_gather().unwrap())
            })
            .unwrap();
            for (y, yt) in results {
                assert_eq!(y, expected, "{split:?}");
                assert_eq!(yt, expected, "{split:?}");
            }
        }
    }

    #[test]
    fn scaling_scales_products() {
        let x = [1.0, 2.0, 4.0, 8.0];
        let results = run(2, |ch| {
            let mut a = tridiag(&ch, Split::Columns);
            a.scale(-0.5);
            let xv = DistVector::from_global(Arc::clone(&ch), &x, 2).unwrap();
            let mut y = a.row_vector().unwrap();
            a.multiply(&xv, &mut y).unwrap();
            y.all_gather().unwrap()
        })
        .unwrap();
        for y in results {
            assert_eq!(y, [0.0, 0.5, 1.0, -6.0]);
        }
    }

    #[test]
    fn entry_rules() {
        let results = run(2, |ch| {
            let mut a = tridiag(&ch, Split::Rows);
            let r = ch.rank();
            let foreign_row = if r == 0 { 3 } else { 0 };
            let unpatterned = if r == 0 { 3 } else { 0 };
            (
                a.get(2 * r, 2 * r),
                a.get(foreign_row, 0),
                a.set(2 * r, unpatterned, 1.0),
                a.add(1 + r, 2 - r, 0.5),
            )
        })
        .unwrap();
        assert_eq!(results[0].0, Ok(2.0));
        assert_eq!(results[0].1, Err(KError::NotLocal { index: 3, start: 0, end: 2 }));
        assert_eq!(results[0].2, Err(KError::NotInPattern { index: 3 }));
        assert_eq!(results[0].3, Ok(()));
        assert_eq!(results[1].2, Err(KError::NotInPattern { index: 0 }));
        assert_eq!(results[1].3, Ok(()));
    }

    #[test]
    fn misplaced_off_entry_is_rejected_everywhere() {
        let results = run(2, |ch| {
            let diag = SparseRowMatrix::new(1, 1);
            let mut off = SparseRowMatrix::new(1, 2);
            if ch.rank() == 0 {
                off.set(0, 0, 1.0);
            }
            DistMatrix::row_split(2, 2, Arc::clone(&ch), diag, off).map(|_| ())
        })
        .unwrap();
        assert!(results.iter().all(|r| matches!(r, Err(KError::InvalidArgument(_)))));
    }
}
