use thiserror::Error;

/// Alias for `core::result::Result<T, Error>`.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors from chunk tree operations.
///
/// `Clone` and `Eq` are derived because the outcome of a completed concurrent
/// task is read by every thread that helped it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The signing primitive failed while signing a leaf or node.
    #[error("signature computation failure: {0}")]
    SignatureComputationFailure(String),
    /// A signature did not match the bytes it should cover.
    #[error("signature verification failure: {0}")]
    SignatureVerificationFailure(String),
    /// Malformed blob or a broken tree invariant.
    #[error("structural inconsistency: {0}")]
    StructuralInconsistency(String),
    /// A chunk position outside the tree.
    #[error("position {position} out of range (size {size})")]
    IndexOutOfRange { position: usize, size: usize },
    /// A chunk that would make the stream impossible to re-chunk.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        Error::StructuralInconsistency(msg.into())
    }
}
