// Jacobi preconditioner implementation

use crate::core::traits::LocalMatrix;
use crate::error::KError;
use crate::preconditioner::Preconditioner;

/// Jacobi preconditioner: M⁻¹ = D⁻¹
///
/// Zero diagonal entries map to zero, so their rows pass through as zero.
#[derive(Debug, Clone, Default)]
pub struct Jacobi {
    pub(crate) inv_diag: Vec<f64>,
}

impl Jacobi {
    /// new with empty state; user must call `setup`.
    pub fn new() -> Self {
        Self { inv_diag: Vec::new() }
    }

    fn check_len(&self, len: usize) -> Result<(), KError> {
        if len != self.inv_diag.len() {
            return Err(KError::SizeMismatch { expected: self.inv_diag.len(), actual: len });
        }
        Ok(())
    }
}

impl<M: LocalMatrix> Preconditioner<M, [f64]> for Jacobi {
    fn setup(&mut self, a: &M) -> Result<(), KError> {
        let n = a.nrows().min(a.ncols());
        self.inv_diag = (0..n)
            .map(|i| a.get(i, i))
            .map(|d| if d != 0.0 { 1.0 / d } else { 0.0 })
            .collect();
        Ok(())
    }

    fn apply(&self, b: &[f64], x: &mut [f64]) -> Result<(), KError> {
        self.check_len(b.len())?;
        self.check_len(x.len())?;
        for ((xi, &bi), &d) in x.iter_mut().zip(b).zip(&self.inv_diag) {
            *xi = d * bi;
        }
        Ok(())
    }

    fn trans_apply(&self, b: &[f64], x: &mut [f64]) -> Result<(), KError> {
        Preconditioner::<M, [f64]>::apply(self, b, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::SparseRowMatrix;

    #[test]
    fn scales_by_inverse_diagonal() {
        let a = SparseRowMatrix::from_triplets(3, 3, &[(0, 0, 2.0), (1, 1, 4.0), (0, 1, 9.0)]);
        let mut pc = Jacobi::new();
        Preconditioner::<SparseRowMatrix, [f64]>::setup(&mut pc, &a).unwrap();
        let mut x = [7.0; 3];
        Preconditioner::<SparseRowMatrix, [f64]>::apply(&pc, &[1.0, 1.0, 1.0], &mut x).unwrap();
        assert_eq!(x, [0.5, 0.25, 0.0]);
        let err = Preconditioner::<SparseRowMatrix, [f64]>::apply(&pc, &[1.0], &mut x);
        assert_eq!(err, Err(KError::SizeMismatch { expected: 3, actual: 1 }));
    }
}
