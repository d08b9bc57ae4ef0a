//! vmpi: in-process virtual message passing and distributed linear algebra
//!
//! A fixed group of ranks, one thread each, communicates through
//! [`parallel::Channel`]s: blocking and non-blocking point-to-point
//! transfers plus deterministic collectives. On top of that sit
//! block-distributed vectors and matrices with halo exchange, and a
//! two-level (coarse-corrected) preconditioner for use in Krylov solvers.

pub mod parallel;

pub mod config;
pub mod core;
pub mod distributed;
pub mod error;
pub mod matrix;
pub mod preconditioner;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use crate::core::*;
pub use distributed::*;
pub use error::*;
pub use matrix::*;
pub use parallel::{Channel, CollectiveGroup, ReduceOp, Reducible, Request, run};
pub use preconditioner::*;
pub use solver::*;

// Re-export SolveStats at the crate root for convenience
pub use utils::convergence::{Convergence, SolveStats};
