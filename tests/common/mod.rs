//! Shared fixtures: global test matrices and their distribution over ranks.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use vmpi::distributed::{DistMatrix, DistVector, Ownership, Split};
use vmpi::matrix::SparseRowMatrix;
use vmpi::parallel::Channel;
use vmpi::LocalMatrix;

/// A global sparse matrix as (row, column, value) triplets.
#[derive(Clone, Debug)]
pub struct Global {
    pub nrows: usize,
    pub ncols: usize,
    pub entries: Vec<(usize, usize, f64)>,
}

impl Global {
    pub fn dense(&self) -> Vec<Vec<f64>> {
        let mut a = vec![vec![0.0; self.ncols]; self.nrows];
        for &(i, j, v) in &self.entries {
            a[i][j] += v;
        }
        a
    }

    pub fn transpose(&self) -> Global {
        Global {
            nrows: self.ncols,
            ncols: self.nrows,
            entries: self.entries.iter().map(|&(i, j, v)| (j, i, v)).collect(),
        }
    }

    pub fn matvec(&self, x: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; self.nrows];
        for &(i, j, v) in &self.entries {
            y[i] += v * x[j];
        }
        y
    }
}

/// Random `nrows × ncols` matrix with roughly `density` of its entries set.
pub fn random(nrows: usize, ncols: usize, density: f64, seed: u64) -> Global {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut entries = Vec::new();
    for i in 0..nrows {
        for j in 0..ncols {
            if rng.r#gen::<f64>() < density {
                entries.push((i, j, rng.r#gen::<f64>() * 2.0 - 1.0));
            }
        }
    }
    Global { nrows, ncols, entries }
}

/// Random non-symmetric, strictly diagonally dominant `n × n` matrix.
pub fn diag_dominant(n: usize, density: f64, seed: u64) -> Global {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut entries = Vec::new();
    for i in 0..n {
        let mut row_sum = 0.0;
        for j in 0..n {
            if i != j && rng.r#gen::<f64>() < density {
                let v = -rng.r#gen::<f64>();
                row_sum += v.abs();
                entries.push((i, j, v));
            }
        }
        entries.push((i, i, row_sum + 1.0));
    }
    Global { nrows: n, ncols: n, entries }
}

/// 1-D Laplacian with Dirichlet (`neumann == false`) or Neumann ends.
pub fn laplacian(n: usize, neumann: bool) -> Global {
    let mut entries = Vec::new();
    for i in 0..n {
        let end = i == 0 || i + 1 == n;
        entries.push((i, i, if neumann && end { 1.0 } else { 2.0 }));
        if i > 0 {
            entries.push((i, i - 1, -1.0));
        }
        if i + 1 < n {
            entries.push((i, i + 1, -1.0));
        }
    }
    Global { nrows: n, ncols: n, entries }
}

/// Split `n` into `parts` near-equal contiguous blocks.
pub fn even_sizes(n: usize, parts: usize) -> Vec<usize> {
    (0..parts).map(|r| n / parts + usize::from(r < n % parts)).collect()
}

/// This rank's (diag, off) blocks of `g`.
pub fn local_blocks(
    g: &Global,
    rank: usize,
    row_sizes: &[usize],
    col_sizes: &[usize],
    split: Split,
) -> (SparseRowMatrix, SparseRowMatrix) {
    let rows = Ownership::from_sizes(row_sizes).range(rank);
    let cols = Ownership::from_sizes(col_sizes).range(rank);
    let mut diag = SparseRowMatrix::new(rows.len(), cols.len());
    let mut off = match split {
        Split::Rows => SparseRowMatrix::new(rows.len(), g.ncols),
        Split::Columns => SparseRowMatrix::new(g.nrows, cols.len()),
    };
    for &(i, j, v) in &g.entries {
        let (in_rows, in_cols) = (rows.contains(&i), cols.contains(&j));
        match split {
            Split::Rows if in_rows && in_cols => diag.add(i - rows.start, j - cols.start, v),
            Split::Rows if in_rows => off.add(i - rows.start, j, v),
            Split::Columns if in_cols && in_rows => diag.add(i - rows.start, j - cols.start, v),
            Split::Columns if in_cols => off.add(i, j - cols.start, v),
            _ => {}
        }
    }
    (diag, off)
}

/// Collective: distribute `g` over the ranks of `ch`.
pub fn distribute(ch: &Arc<Channel>, g: &Global, row_sizes: &[usize], col_sizes: &[usize], split: Split) -> DistMatrix {
    let (diag, off) = local_blocks(g, ch.rank(), row_sizes, col_sizes, split);
    let built = match split {
        Split::Rows => DistMatrix::row_split(g.nrows, g.ncols, Arc::clone(ch), diag, off),
        Split::Columns => DistMatrix::column_split(g.nrows, g.ncols, Arc::clone(ch), diag, off),
    };
    built.unwrap()
}

/// Collective: this rank's block of a replicated vector.
pub fn scatter_vec(ch: &Arc<Channel>, global: &[f64], sizes: &[usize]) -> DistVector {
    DistVector::from_global(Arc::clone(ch), global, sizes[ch.rank()]).unwrap()
}

pub fn random_vec(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.r#gen::<f64>() * 2.0 - 1.0).collect()
}
