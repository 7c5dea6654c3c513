//! Error types for the evaluation engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EvalError>;

/// Main error type for the evaluation engine
#[derive(Error, Debug)]
pub enum EvalError {
    /// Invalid or degenerate partition, grid, or option value. Fails the
    /// run before any fold executes.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    /// A single fold could not be fit or scored. Callers record this and
    /// continue with the remaining folds.
    #[error("Fold error: {0}")]
    FoldError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Unknown classifier: {0}")]
    UnknownClassifier(String),

    #[error("Model not fitted")]
    ModelNotFitted,
}

impl From<polars::error::PolarsError> for EvalError {
    fn from(err: polars::error::PolarsError) -> Self {
        EvalError::DataError(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for EvalError {
    fn from(err: serde_yaml::Error) -> Self {
        EvalError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for EvalError {
    fn from(err: ndarray::ShapeError) -> Self {
        EvalError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}
