//! Error types for prodex-core

use thiserror::Error;

/// Errors raised while loading or rendering training data.
///
/// A data error is fatal and aborts the run before any model work begins.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in training data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Example {index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("Example {index} is missing the required '{field}' field")]
    MissingField { index: usize, field: &'static str },

    #[error("Training data file contains no examples")]
    Empty,
}
