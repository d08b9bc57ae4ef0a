//! In-process virtual message passing.
//!
//! A fixed group of P ranks, one thread each, shares a [`CollectiveGroup`].
//! Every rank obtains its own [`Channel`] through a one-time collective
//! handshake and uses it for blocking and non-blocking point-to-point
//! transfers and for the collectives (broadcast, gather, scatter,
//! all-gather, all-to-all, reduce, all-reduce, barrier).
//!
//! Collectives must be issued in the same order on every rank. A rank that
//! issues a different collective at the same position is detected and the
//! group is broken, failing every participant.
//!
//! # Example
//! ```
//! use vmpi::parallel::{run, ReduceOp};
//!
//! let sums = run(4, |ch| ch.all_reduce_scalar(ch.rank() as u64, ReduceOp::Sum)).unwrap();
//! assert!(sums.iter().all(|s| *s == Ok(6)));
//! ```

pub mod channel;
pub mod group;
pub mod reduce;
pub mod request;

pub use channel::Channel;
pub use group::{CollectiveGroup, run};
pub use reduce::{ReduceOp, Reducible};
pub use request::{Request, wait_all};
