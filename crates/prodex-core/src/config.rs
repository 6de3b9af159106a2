//! Run configuration

use std::path::PathBuf;

/// Immutable configuration for one trainer invocation.
///
/// Fixed for the lifetime of the run; components receive it by reference and
/// never mutate it.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Path to the JSON training data.
    pub data_path: PathBuf,
    /// Directory for adapters, checkpoints and exports.
    pub output_dir: PathBuf,
    /// Number of training epochs.
    pub epochs: usize,
    /// Batch size per device.
    pub batch_size: usize,
    /// Base learning rate.
    pub learning_rate: f64,
}
