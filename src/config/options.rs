//! Options for collective groups and the two-level preconditioner.
//!
//! Both structs are plain data with sensible defaults; validation against a
//! concrete group happens where they are consumed.

/// Collective group parameters.
///
/// Every rank is an OS thread. Non-blocking transfers add one lane thread
/// per rank, peer and direction in use (see [`Channel`](crate::parallel::Channel)),
/// so densely coupled groups of size `P` may hold up to `2P(P-1)` lane
/// threads on top of the `P` rank threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOptions {
    /// Number of ranks (threads) in the group.
    pub size: usize,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self { size: num_cpus::get().max(1) }
    }
}

impl GroupOptions {
    pub fn with_size(size: usize) -> Self {
        Self { size }
    }
}

/// Two-level (coarse-grid corrected) preconditioner parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TwoLevelOptions {
    /// Rank that assembles, factors and solves the coarse system.
    pub root: usize,
}

impl TwoLevelOptions {
    pub fn with_root(root: usize) -> Self {
        Self { root }
    }
}
