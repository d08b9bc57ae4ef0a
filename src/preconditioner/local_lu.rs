//! Exact local solve: dense LU of a whole local block.

use crate::core::traits::LocalMatrix;
use crate::error::KError;
use crate::preconditioner::Preconditioner;
use crate::solver::direct_lu::DenseLu;
use faer::Mat;

/// M⁻¹ = A⁻¹ for a local (square) block, factored densely.
///
/// Meant for the modest diagonal blocks of a distributed operator, where the
/// dense factorization is cheap next to the communication it saves.
#[derive(Debug, Default)]
pub struct LocalLu {
    lu: Option<DenseLu>,
}

impl LocalLu {
    pub fn new() -> Self {
        Self { lu: None }
    }

    fn factor(&self) -> Result<&DenseLu, KError> {
        self.lu
            .as_ref()
            .ok_or_else(|| KError::InvalidArgument("LocalLu applied before setup".into()))
    }
}

impl<M: LocalMatrix> Preconditioner<M, [f64]> for LocalLu {
    fn setup(&mut self, a: &M) -> Result<(), KError> {
        let mut dense = Mat::<f64>::zeros(a.nrows(), a.ncols());
        a.for_each_nonzero(|i, j, v| dense[(i, j)] += v);
        self.lu = Some(DenseLu::factor(&dense)?);
        Ok(())
    }

    fn apply(&self, b: &[f64], x: &mut [f64]) -> Result<(), KError> {
        self.factor()?.solve(b, x)
    }

    fn trans_apply(&self, b: &[f64], x: &mut [f64]) -> Result<(), KError> {
        self.factor()?.solve_transpose(b, x)
    }
}
