//! Block-distributed vectors and matrices over a [`Channel`](crate::parallel::Channel).

pub mod halo;
pub mod matrix;
pub mod ownership;
pub mod vector;

pub use halo::{HaloExchange, PendingExchange};
pub use matrix::{DistMatrix, Split};
pub use ownership::Ownership;
pub use vector::DistVector;
