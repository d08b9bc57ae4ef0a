//! Flexible row-compressed sparse matrix.
//!
//! Each row keeps its column indices sorted with the values alongside, so
//! entries can be inserted after construction. This is the storage used for
//! the off-diagonal blocks of distributed matrices, whose column (or row)
//! range spans the whole global dimension.

use crate::core::traits::LocalMatrix;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseRowMatrix {
    nrows: usize,
    ncols: usize,
    cols: Vec<Vec<usize>>,
    vals: Vec<Vec<f64>>,
}

impl SparseRowMatrix {
    /// Empty `nrows × ncols` matrix.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            cols: vec![Vec::new(); nrows],
            vals: vec![Vec::new(); nrows],
        }
    }

    /// Build from (row, column, value) triplets; duplicates are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut m = Self::new(nrows, ncols);
        for &(i, j, v) in triplets {
            LocalMatrix::add(&mut m, i, j, v);
        }
        m
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.cols.iter().map(Vec::len).sum()
    }

    /// Stored (column, value) pairs of row `i`, by increasing column.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.cols[i].iter().copied().zip(self.vals[i].iter().copied())
    }

    fn slot(&mut self, i: usize, j: usize) -> &mut f64 {
        assert!(i < self.nrows && j < self.ncols, "entry ({i}, {j}) out of bounds");
        let pos = match self.cols[i].binary_search(&j) {
            Ok(pos) => pos,
            Err(pos) => {
                self.cols[i].insert(pos, j);
                self.vals[i].insert(pos, 0.0);
                pos
            }
        };
        &mut self.vals[i][pos]
    }
}

impl LocalMatrix for SparseRowMatrix {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        match self.cols[i].binary_search(&j) {
            Ok(pos) => self.vals[i][pos],
            Err(_) => 0.0,
        }
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        *self.slot(i, j) = value;
    }

    fn add(&mut self, i: usize, j: usize, value: f64) {
        *self.slot(i, j) += value;
    }

    fn mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        assert_eq!(self.ncols, x.len(), "Input vector x has incorrect length");
        assert_eq!(self.nrows, y.len(), "Output vector y has incorrect length");
        for (i, yi) in y.iter_mut().enumerate() {
            let sum: f64 = self.row(i).map(|(j, v)| v * x[j]).sum();
            *yi += alpha * sum;
        }
    }

    fn trans_mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        assert_eq!(self.nrows, x.len(), "Input vector x has incorrect length");
        assert_eq!(self.ncols, y.len(), "Output vector y has incorrect length");
        for (i, &xi) in x.iter().enumerate() {
            let axi = alpha * xi;
            for (j, v) in self.row(i) {
                y[j] += v * axi;
            }
        }
    }

    fn for_each_nonzero<F: FnMut(usize, usize, f64)>(&self, mut f: F) {
        for i in 0..self.nrows {
            for (j, v) in self.row(i) {
                f(i, j, v);
            }
        }
    }

    fn map_nonzeros<F: FnMut(usize, usize, f64) -> f64>(&mut self, mut f: F) {
        for i in 0..self.nrows {
            for (&j, v) in self.cols[i].iter().zip(self.vals[i].iter_mut()) {
                *v = f(i, j, *v);
            }
        }
    }

    fn zero(&mut self) {
        for row in &mut self.vals {
            row.fill(0.0);
        }
    }
}
