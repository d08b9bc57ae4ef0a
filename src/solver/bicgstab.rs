//! Right-preconditioned BiCGStab (Saad §7.1) over distributed vectors.
//!
//! Every inner product is an all-reduce, so all ranks see the same scalars
//! and take the same branches; the solve is collective.

use crate::core::traits::LocalMatrix;
use crate::distributed::{DistMatrix, DistVector};
use crate::error::KError;
use crate::preconditioner::Preconditioner;
use crate::solver::LinearSolver;
use crate::utils::convergence::{Convergence, SolveStats};

const BREAKDOWN: f64 = 1e-300;

pub struct BiCgStabSolver {
    pub conv: Convergence<f64>,
}

impl BiCgStabSolver {
    pub fn new(tol: f64, max_iters: usize) -> Self {
        Self { conv: Convergence { tol, max_iters } }
    }
}

/// `out ← M⁻¹·v`, or a copy of `v` without a preconditioner.
fn precondition<M>(
    pc: Option<&dyn Preconditioner<M, DistVector>>,
    v: &DistVector,
    out: &mut DistVector,
) -> Result<(), KError> {
    match pc {
        Some(pc) => {
            out.zero();
            pc.apply(v, out)
        }
        None => out.copy_from(v),
    }
}

fn breakdown(what: &str) -> KError {
    KError::NotSolvable(format!("BiCGStab breakdown: {what} ~ 0"))
}

impl<M: LocalMatrix> LinearSolver<DistMatrix<M>, DistVector> for BiCgStabSolver {
    type Error = KError;
    type Scalar = f64;

    fn solve(
        &mut self,
        a: &DistMatrix<M>,
        pc: Option<&dyn Preconditioner<DistMatrix<M>, DistVector>>,
        b: &DistVector,
        x: &mut DistVector,
    ) -> Result<SolveStats<f64>, KError> {
        let _span = tracing::debug_span!("bicgstab", rank = a.channel().rank(), n = b.size()).entered();

        let mut r = a.row_vector()?;
        a.residual(b, x, &mut r, false)?;
        let r_hat = r.clone();
        let b_norm = b.norm2()?;
        let res0 = r.norm2()?;
        let (stop, mut stats) = self.conv.check(res0, b_norm, 0);
        if stop {
            return Ok(stats);
        }

        let mut p = a.row_vector()?;
        let mut v = a.row_vector()?;
        let mut s = a.row_vector()?;
        let mut t = a.row_vector()?;
        let mut p_hat = a.column_vector()?;
        let mut s_hat = a.column_vector()?;

        let mut rho_prev = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;

        for i in 1..=self.conv.max_iters {
            let rho = r_hat.dot(&r)?;
            if rho.abs() < BREAKDOWN {
                return Err(breakdown("rho"));
            }
            let beta = (rho / rho_prev) * (alpha / omega);

            // p = r + beta * (p - omega * v)
            p.axpy(-omega, &v)?;
            p.aypx(beta, &r)?;

            precondition(pc, &p, &mut p_hat)?;
            a.multiply(&p_hat, &mut v)?;
            let r_hat_v = r_hat.dot(&v)?;
            if r_hat_v.abs() < BREAKDOWN {
                return Err(breakdown("r_hat.v"));
            }
            alpha = rho / r_hat_v;

            // s = r - alpha * v
            s.copy_from(&r)?;
            s.axpy(-alpha, &v)?;
            let s_norm = s.norm2()?;
            let (_, st) = self.conv.check(s_norm, b_norm, i);
            if st.converged {
                x.axpy(alpha, &p_hat)?;
                tracing::debug!(iterations = i, residual = s_norm, "BiCGStab converged");
                return Ok(st);
            }

            precondition(pc, &s, &mut s_hat)?;
            a.multiply(&s_hat, &mut t)?;
            let t_s = t.dot(&s)?;
            let t_t = t.dot(&t)?;
            if t_t.abs() < BREAKDOWN {
                return Err(breakdown("||t||"));
            }
            omega = t_s / t_t;

            x.axpy(alpha, &p_hat)?;
            x.axpy(omega, &s_hat)?;

            // r = s - omega * t
            r.copy_from(&s)?;
            r.axpy(-omega, &t)?;
            let r_norm = r.norm2()?;
            if !r_norm.is_finite() {
                return Err(KError::NotSolvable("BiCGStab diverged: non-finite residual".into()));
            }
            let (stop, st) = self.conv.check(r_norm, b_norm, i);
            stats = st;
            if stop {
                break;
            }
            if omega.abs() < BREAKDOWN {
                return Err(breakdown("omega"));
            }
            rho_prev = rho;
        }
        tracing::debug!(
            iterations = stats.iterations,
            residual = stats.final_residual,
            converged = stats.converged,
            "BiCGStab finished"
        );
        Ok(stats)
    }
}
