//! Configuration structs.

pub mod options;
pub use options::{GroupOptions, TwoLevelOptions};
