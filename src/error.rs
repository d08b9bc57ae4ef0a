use thiserror::Error;

// Unified error type for vmpi

pub type Result<T> = std::result::Result<T, KError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("rank {rank} cannot send to or receive from itself")]
    SelfMessage { rank: usize },
    #[error("range {offset}..{offset}+{length} exceeds buffer of length {capacity}")]
    BufferOverflow {
        offset: usize,
        length: usize,
        capacity: usize,
    },
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("entry not local: index {index} outside owned range {start}..{end}")]
    NotLocal {
        index: usize,
        start: usize,
        end: usize,
    },
    #[error("index {index} is not part of the communication pattern")]
    NotInPattern { index: usize },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("collective mismatch at operation {seq}: expected {expected}, found {found}")]
    CollectiveMismatch {
        seq: u64,
        expected: &'static str,
        found: &'static str,
    },
    #[error("system not solvable: {0}")]
    NotSolvable(String),
    #[error("factorization error: {0}")]
    FactorError(String),
}

impl KError {
    /// Shorthand for a fatal communication failure.
    pub fn comm(msg: impl Into<String>) -> Self {
        KError::Communication(msg.into())
    }

    /// Whether the error leaves the group unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KError::Communication(_) | KError::CollectiveMismatch { .. }
        )
    }
}
