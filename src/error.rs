//! Error taxonomy for the extraction pipeline.
//!
//! Kinds, not types: each variant names a failure *class* from the design doc
//! rather than wrapping a specific library error. Module boundaries return
//! `Result<_, ExtractorError>`; call sites that only need to log-and-degrade
//! (cache/persistence misses) use `anyhow` instead, matching the rest of this
//! codebase.

use thiserror::Error;

/// Top-level error kind for the extraction pipeline.
#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExtractorError {
    /// The method tag to surface in `Metadata` when this error aborts a request.
    pub fn method_tag(&self) -> &'static str {
        match self {
            ExtractorError::Validation(_) => "validation",
            ExtractorError::Parse(_) => "parse",
            ExtractorError::Llm(_) => "llm",
            ExtractorError::Persistence(_) => "persistence",
            ExtractorError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractorError>;
