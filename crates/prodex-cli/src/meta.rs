//! Run metadata written next to the trained adapter

use crate::error::CliError;
use chrono::Utc;
use prodex_candle::LoraSpec;
use prodex_core::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What went into a training run, saved as `meta.toml` in the output
/// directory so later conversions and comparisons can see it.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub base_model: String,
    pub lora_rank: usize,
    pub lora_alpha: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub created_at: String,
}

impl RunMetadata {
    pub fn new(name: &str, base_model: &str, spec: &LoraSpec, run: &RunConfig) -> Self {
        Self {
            name: name.to_string(),
            base_model: base_model.to_string(),
            lora_rank: spec.rank,
            lora_alpha: spec.alpha,
            epochs: run.epochs,
            batch_size: run.batch_size,
            learning_rate: run.learning_rate,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn save(&self, output_dir: &Path) -> Result<(), CliError> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| CliError::InvalidInput(format!("Failed to render metadata: {e}")))?;
        std::fs::write(output_dir.join("meta.toml"), rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn metadata_round_trips_through_toml() {
        let run = RunConfig {
            data_path: PathBuf::from("produktdaten.json"),
            output_dir: PathBuf::from("output"),
            epochs: 3,
            batch_size: 2,
            learning_rate: 2e-4,
        };
        let meta = RunMetadata::new("prodex", "TinyLlama/TinyLlama-1.1B-Chat-v1.0", &LoraSpec::default(), &run);

        let dir = tempfile::tempdir().unwrap();
        meta.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("meta.toml")).unwrap();
        let parsed: RunMetadata = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.base_model, "TinyLlama/TinyLlama-1.1B-Chat-v1.0");
        assert_eq!(parsed.lora_rank, 64);
        assert_eq!(parsed.epochs, 3);
    }
}
