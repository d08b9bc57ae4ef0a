//! Distributed BiCGStab with and without preconditioning.
//!
//! Each test solves a system with a known solution on several ranks and
//! compares the gathered iterate with it.

mod common;

use common::{diag_dominant, distribute, even_sizes, laplacian, scatter_vec, Global};
use vmpi::distributed::{DistMatrix, Split};
use vmpi::parallel::run;
use vmpi::preconditioner::{BlockDiagonal, Jacobi, LocalLu, Preconditioner, TwoLevel};
use vmpi::solver::{BiCgStabSolver, LinearSolver};
use vmpi::SolveStats;

/// Compute the relative L2 error between two vectors.
fn rel_error(x: &[f64], x_true: &[f64]) -> f64 {
    let num: f64 = x.iter().zip(x_true).map(|(a, b)| (a - b).powi(2)).sum();
    let den: f64 = x_true.iter().map(|b| b * b).sum();
    (num / den).sqrt()
}

#[derive(Clone, Copy, Debug)]
enum Pc {
    None,
    BlockJacobi,
    BlockLu,
    TwoLevel,
}

fn solve(g: &Global, ranks: usize, split: Split, pc: Pc) -> Vec<(Vec<f64>, SolveStats<f64>)> {
    let n = g.nrows;
    let sizes = even_sizes(n, ranks);
    let x_true: Vec<f64> = (0..n).map(|i| 1.0 + (i % 3) as f64).collect();
    let b0 = g.matvec(&x_true);
    run(ranks, |ch| {
        let a: DistMatrix = distribute(&ch, g, &sizes, &sizes, split);
        let b = scatter_vec(&ch, &b0, &sizes);
        let mut x = a.column_vector().unwrap();
        let mut solver = BiCgStabSolver::new(1e-10, 500);
        let stats = match pc {
            Pc::None => solver.solve(&a, None, &b, &mut x),
            Pc::BlockJacobi => {
                let mut p = BlockDiagonal::new(Jacobi::new());
                p.setup(&a).unwrap();
                solver.solve(&a, Some(&p), &b, &mut x)
            }
            Pc::BlockLu => {
                let mut p = BlockDiagonal::new(LocalLu::new());
                p.setup(&a).unwrap();
                solver.solve(&a, Some(&p), &b, &mut x)
            }
            Pc::TwoLevel => {
                let mut p: TwoLevel = TwoLevel::new(LocalLu::new());
                p.setup(&a).unwrap();
                solver.solve(&a, Some(&p), &b, &mut x)
            }
        }
        .unwrap();
        (x.all_gather().unwrap(), stats)
    })
    .unwrap()
    .into_iter()
    .map(|(x, stats)| {
        let err = rel_error(&x, &x_true);
        assert!(err < 1e-6, "{pc:?}: relative error {err:e}, stats = {stats:?}");
        (x, stats)
    })
    .collect()
}

#[test]
fn unpreconditioned_converges() {
    for (_, stats) in solve(&diag_dominant(30, 0.2, 21), 3, Split::Rows, Pc::None) {
        assert!(stats.converged, "stats = {stats:?}");
    }
}

#[test]
fn block_preconditioners_converge_on_both_splits() {
    let g = diag_dominant(32, 0.15, 22);
    for split in [Split::Rows, Split::Columns] {
        for pc in [Pc::BlockJacobi, Pc::BlockLu, Pc::TwoLevel] {
            for (_, stats) in solve(&g, 4, split, pc) {
                assert!(stats.converged, "{split:?} {pc:?}: stats = {stats:?}");
            }
        }
    }
}

#[test]
fn laplacian_with_every_preconditioner() {
    let g = laplacian(48, false);
    for pc in [Pc::BlockJacobi, Pc::BlockLu, Pc::TwoLevel] {
        let results = solve(&g, 4, Split::Rows, pc);
        assert!(results[0].1.converged, "{pc:?}: stats = {:?}", results[0].1);
    }
}

#[test]
fn every_rank_reports_the_same_stats() {
    let results = solve(&diag_dominant(20, 0.3, 23), 5, Split::Rows, Pc::TwoLevel);
    let (x0, s0) = &results[0];
    for (x, s) in &results[1..] {
        assert_eq!(x, x0);
        assert_eq!(s, s0);
    }
}
