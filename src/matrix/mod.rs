//! Matrix module: local matrix types.

pub mod sparse;
pub use sparse::SparseRowMatrix;
