//! Preconditioners for linear solvers.
//!
//! Local preconditioners ([`Jacobi`], [`LocalLu`]) act on one rank's
//! diagonal block through plain slices. Distributed ones ([`BlockDiagonal`],
//! [`TwoLevel`]) act on [`DistVector`](crate::distributed::DistVector)s and
//! are collective.

use crate::error::KError;

/// A preconditioner M ≈ A⁻¹.
///
/// `apply` takes the right-hand side `b` and the current iterate `x`. Local
/// preconditioners overwrite `x` with `M⁻¹·b`; corrective ones such as
/// [`TwoLevel`] improve the incoming `x`. With `x` zeroed on entry both give
/// `x = M⁻¹·b`.
pub trait Preconditioner<M, V: ?Sized> {
    /// Apply M⁻¹ to `b`, writing into `x`.
    fn apply(&self, b: &V, x: &mut V) -> Result<(), KError>;
    /// Apply M⁻ᵀ to `b`, writing into `x`.
    fn trans_apply(&self, b: &V, x: &mut V) -> Result<(), KError>;
    /// Bind the operator and (re)build any factorization from it.
    fn setup(&mut self, _a: &M) -> Result<(), KError> {
        Ok(())
    }
}

pub mod block_diagonal;
pub mod jacobi;
pub mod local_lu;
pub mod two_level;

pub use block_diagonal::BlockDiagonal;
pub use jacobi::Jacobi;
pub use local_lu::LocalLu;
pub use two_level::TwoLevel;
