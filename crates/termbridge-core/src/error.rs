//! Error taxonomy shared by the stores and the translation pipeline.
//!
//! Absence is never an error here: lookups return `Option`/`bool`. The
//! variants below cover the conditions callers need to distinguish by
//! matching, most importantly the difference between an embedding backend
//! being unreachable (degrade to lexical search) and a generation call
//! timing out (retry once, then surface).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A vector of the wrong length was offered to a collection whose
    /// dimensionality is already fixed. The collection is left untouched.
    #[error("vector dimension mismatch: collection holds {expected}-dim vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding backend is not reachable or not configured.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// The generation backend did not answer within the allotted time.
    #[error("generation timed out")]
    GenerationTimeout,

    /// The generation backend is unreachable or rejected the request.
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// A persisted file could not be understood. Recovered locally by
    /// quarantining the file and continuing with an empty state; this
    /// variant never propagates out of the stores.
    #[error("corrupt persisted data: {0}")]
    CorruptPersistence(String),
}
