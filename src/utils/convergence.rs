//! Convergence tracking & tolerance checks for iterative solvers.

/// Stopping criteria: relative residual tolerance and an iteration cap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Convergence<T> {
    pub tol: T,
    pub max_iters: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SolveStats<T> {
    pub iterations: usize,
    pub final_residual: T,
    pub converged: bool,
}

impl<T: Copy + num_traits::Float> Convergence<T> {
    pub fn new(tol: T, max_iters: usize) -> Self {
        Self { tol, max_iters }
    }

    /// Returns (should_stop, stats) given current `res_norm`, the reference
    /// norm `res0_norm` and iteration `i`.
    ///
    /// A zero reference norm measures `res_norm` absolutely.
    pub fn check(&self, res_norm: T, res0_norm: T, i: usize) -> (bool, SolveStats<T>) {
        let rel = if res0_norm > T::zero() { res_norm / res0_norm } else { res_norm };
        let converged = rel <= self.tol;
        (
            converged || i >= self.max_iters,
            SolveStats {
                iterations: i,
                final_residual: res_norm,
                converged,
            },
        )
    }
}
