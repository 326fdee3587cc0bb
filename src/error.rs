//! Error types for parlance.

use thiserror::Error;

/// Result type for parlance operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for parlance operations.
///
/// External-service failures during a turn are absorbed by the pipeline
/// (the failing recognizer or model simply contributes nothing); this type
/// surfaces at construction and configuration boundaries — index building,
/// schema ingestion, client setup.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Schema metadata is missing or inconsistent.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Expression corpus could not be parsed or indexed.
    #[error("Index error: {0}")]
    Index(String),

    /// A model service request could not even be constructed.
    #[error("Model service error: {0}")]
    ModelService(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    /// Create an index error.
    pub fn index(msg: impl Into<String>) -> Self {
        Error::Index(msg.into())
    }

    /// Create a model service error.
    pub fn model_service(msg: impl Into<String>) -> Self {
        Error::ModelService(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}
