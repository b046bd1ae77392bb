//! Typed error kinds. Foreground failures never corrupt state;
//! background failures never crash the loop.

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// LLM/embedding/HTTP/vector-DB I/O failure. Callers yield a safe
    /// default (empty list, unchanged state, `false`) and log — this kind
    /// is never propagated up to the session loop.
    #[error("transient external failure: {0}")]
    Transient(String),

    /// Bad index, malformed JSON, missing content. Returned as an
    /// error-typed result to the caller without mutating state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// External-embedding mode violated, or an embedding dimension
    /// mismatch. Writes are refused; reads yield empty.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Backing filesystem unavailable at startup; the subsystem refuses
    /// to initialize.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        EngineError::Consistency(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        EngineError::Fatal(msg.into())
    }
}
