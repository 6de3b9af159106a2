//! Base model resolution: local directory or Hugging Face download

use crate::error::CliError;
use hf_hub::api::tokio::Api;
use std::path::{Path, PathBuf};

/// Files a usable base model directory must contain.
pub const MODEL_FILES: [&str; 3] = ["config.json", "tokenizer.json", "model.safetensors"];

/// Resolve a model argument to a local directory.
///
/// A path to an existing directory is used as-is. Anything else is treated as
/// a Hugging Face repo id and fetched into `models/`, skipping the download
/// when the files are already there.
pub async fn resolve_model_dir(model: &str) -> Result<PathBuf, CliError> {
    let as_path = Path::new(model);
    if as_path.is_dir() {
        return Ok(as_path.to_path_buf());
    }

    let local_dir = Path::new("models").join(model.replace('/', "--"));
    if MODEL_FILES.iter().all(|f| local_dir.join(f).exists()) {
        println!("📦 Using cached model in {}", local_dir.display());
        return Ok(local_dir);
    }

    println!("🤖 Downloading base model: {model}");
    std::fs::create_dir_all(&local_dir)?;

    let api = Api::new().map_err(|e| CliError::Fetch(e.to_string()))?;
    let repo = api.model(model.to_string());
    for file in MODEL_FILES {
        let fetched = repo
            .get(file)
            .await
            .map_err(|e| CliError::Fetch(format!("{model}/{file}: {e}")))?;
        std::fs::copy(&fetched, local_dir.join(file))?;
        println!("  ✅ {file}");
    }

    Ok(local_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_directories_resolve_to_themselves() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_model_dir(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(resolved, dir.path());
    }
}
