//! Error types for smallworld operations.
//!
//! Structural problems in an encoded graph surface as [`GraphError::Serialization`];
//! failures of the underlying reader or writer (including short reads) surface
//! as [`GraphError::Io`]. Missing keys on lookup or delete are reported through
//! return values (`Option` / `bool`), not errors.

use thiserror::Error;

/// Result type alias for smallworld operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur while building, mutating, querying, or
/// (de)serializing a graph.
#[derive(Error, Debug)]
pub enum GraphError {
    /// A configuration parameter is outside its permitted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation vector's length does not match the graph's dimension.
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// The graph's fixed dimension, set by the first inserted vector.
        expected: usize,
        /// The offending vector's length.
        got: usize,
    },

    /// `k` must be at least 1 for any search.
    #[error("k must be greater than 0, got {0}")]
    InvalidK(usize),

    /// The negative-example weight must lie within `[0, 1]`.
    #[error("negative weight must be within [0, 1], got {0}")]
    InvalidWeight(f32),

    /// The encoded graph was written with an unsupported format version.
    #[error("incompatible encoding version: {0}")]
    IncompatibleVersion(i64),

    /// The named distance function is not present in the registry.
    #[error("unknown distance function {0:?}")]
    UnknownDistanceFunction(String),

    /// The encoded graph is structurally invalid (bad lengths, unresolved
    /// neighbor keys, inconsistent dimensions).
    #[error("corrupt graph encoding: {0}")]
    Serialization(String),

    /// An error from the underlying reader or writer.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A broken internal invariant. The triggering operation was aborted
    /// without mutating the graph.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
