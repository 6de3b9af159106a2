//! Error types for prodex-candle

use std::path::PathBuf;
use thiserror::Error;

/// Load, train or generate failure from the delegated candle stack.
///
/// Fatal during training; never retried.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Invalid model config: {0}")]
    Config(String),

    #[error("No trainable sequences (every prompt tokenized to fewer than 2 tokens)")]
    NoTrainableSequences,
}

/// GGUF conversion failure.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown quantization '{0}' (expected q4_k_m, q5_k_m or q8_0)")]
    UnknownQuantization(String),

    #[error("No GGUF file matching '{0}' found in the output directory")]
    ArtifactNotFound(String),

    #[error("Invalid model config: {0}")]
    Config(String),
}

impl From<ModelError> for ExportError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Candle(e) => ExportError::Candle(e),
            ModelError::Tokenizer(e) => ExportError::Tokenizer(e),
            ModelError::Io(e) => ExportError::Io(e),
            ModelError::MissingFile(p) => {
                ExportError::Config(format!("model file not found: {}", p.display()))
            }
            ModelError::Config(msg) => ExportError::Config(msg),
            ModelError::NoTrainableSequences => {
                ExportError::Config("no trainable sequences".to_string())
            }
        }
    }
}
