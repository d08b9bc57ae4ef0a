//! `LocalMatrix` for Faer dense matrices.
//!
//! A dense `faer::Mat<f64>` can serve as either block of a distributed
//! matrix. Products walk the column-major storage column by column.

use crate::core::traits::LocalMatrix;
use faer::Mat;

impl LocalMatrix for Mat<f64> {
    fn nrows(&self) -> usize {
        self.nrows()
    }

    fn ncols(&self) -> usize {
        self.ncols()
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self[(i, j)]
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        self[(i, j)] = value;
    }

    fn add(&mut self, i: usize, j: usize, value: f64) {
        self[(i, j)] += value;
    }

    fn mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        assert_eq!(self.ncols(), x.len(), "Input vector x has incorrect length");
        assert_eq!(self.nrows(), y.len(), "Output vector y has incorrect length");
        for j in 0..self.ncols() {
            let xj = alpha * x[j];
            if xj == 0.0 {
                continue;
            }
            for i in 0..self.nrows() {
                y[i] += self[(i, j)] * xj;
            }
        }
    }

    fn trans_mult_add(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        assert_eq!(self.nrows(), x.len(), "Input vector x has incorrect length");
        assert_eq!(self.ncols(), y.len(), "Output vector y has incorrect length");
        for j in 0..self.ncols() {
            let mut sum = 0.0;
            for i in 0..self.nrows() {
                sum += self[(i, j)] * x[i];
            }
            y[j] += alpha * sum;
        }
    }

    fn for_each_nonzero<F: FnMut(usize, usize, f64)>(&self, mut f: F) {
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                let v = self[(i, j)];
                if v != 0.0 {
                    f(i, j, v);
                }
            }
        }
    }

    fn map_nonzeros<F: FnMut(usize, usize, f64) -> f64>(&mut self, mut f: F) {
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                let v = self[(i, j)];
                if v != 0.0 {
                    self[(i, j)] = f(i, j, v);
                }
            }
        }
    }

    fn zero(&mut self) {
        *self = Mat::zeros(self.nrows(), self.ncols());
    }
}
