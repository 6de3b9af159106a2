//! Error types for prodex-cli

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Data error: {0}")]
    Data(#[from] prodex_core::DataError),

    #[error("Model error: {0}")]
    Model(#[from] prodex_candle::ModelError),

    #[error("Export error: {0}")]
    Export(#[from] prodex_candle::ExportError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model download failed: {0}")]
    Fetch(String),
}
