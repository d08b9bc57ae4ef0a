//! Block-diagonal (block Jacobi) preconditioning of a distributed operator:
//! each rank applies a local preconditioner to its own diagonal block.

use crate::core::traits::LocalMatrix;
use crate::distributed::{DistMatrix, DistVector};
use crate::error::KError;
use crate::preconditioner::Preconditioner;

/// Applies `P` to the local block of the vector on every rank. No
/// communication happens in `apply`.
#[derive(Debug, Clone, Default)]
pub struct BlockDiagonal<P> {
    local: P,
}

impl<P> BlockDiagonal<P> {
    pub fn new(local: P) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &P {
        &self.local
    }
}

impl<M, P> Preconditioner<DistMatrix<M>, DistVector> for BlockDiagonal<P>
where
    M: LocalMatrix,
    P: Preconditioner<M, [f64]>,
{
    /// Collective: a failure on any rank fails setup everywhere.
    fn setup(&mut self, a: &DistMatrix<M>) -> Result<(), KError> {
        let local = if a.row_ownership() != a.column_ownership() {
            Err(KError::InvalidArgument(
                "block-diagonal preconditioning needs matching row and column blocks".into(),
            ))
        } else {
            self.local.setup(a.diagonal_block())
        };
        a.channel().agree(local)
    }

    fn apply(&self, b: &DistVector, x: &mut DistVector) -> Result<(), KError> {
        x.check_compatible(b)?;
        self.local.apply(b.local(), x.local_mut())
    }

    fn trans_apply(&self, b: &DistVector, x: &mut DistVector) -> Result<(), KError> {
        x.check_compatible(b)?;
        self.local.trans_apply(b.local(), x.local_mut())
    }
}
