//! Convert command implementation

use crate::commands::fetch::MODEL_FILES;
use prodex_candle::{Quantization, export_gguf};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Convert a trained model directory to GGUF.
///
/// Prints remediation hints instead of a bare error and signals failure
/// through the exit code, so it works as the last step of a shell pipeline.
pub async fn run_convert(input: PathBuf, output: PathBuf, quantization: Quantization) -> ExitCode {
    println!("📦 Converting {} to GGUF ({quantization})...\n", input.display());

    if let Err(hint) = check_input_dir(&input) {
        println!("❌ {hint}");
        println!("\n💡 Possible fixes:");
        println!("  - Run the training first: prodex --data produktdaten.json");
        println!("  - Point --input at a directory containing:");
        for file in MODEL_FILES {
            println!("      {file}");
        }
        return ExitCode::FAILURE;
    }

    let adapter = input.join("adapter.safetensors");
    let adapter = adapter.exists().then_some(adapter);
    if adapter.is_none() {
        println!("⚠️  No adapter.safetensors found, converting the base weights only");
    }

    let report = match export_gguf(&input, adapter.as_deref(), &output, quantization) {
        Ok(report) => report,
        Err(e) => {
            println!("❌ Conversion failed: {e}");
            println!("\n💡 Possible fixes:");
            println!("  - Check that the model files are complete and readable");
            println!("  - Check free disk space in {}", output.display());
            println!("  - Try a different quantization (q4_k_m, q5_k_m, q8_0)");
            return ExitCode::FAILURE;
        }
    };

    println!("📁 GGUF files in {}:", output.display());
    for (path, size) in &report.files {
        println!("  {} ({:.2} GB)", path.display(), *size as f64 / 1e9);
    }

    let Some(resolved) = &report.resolved else {
        println!(
            "\n❌ No GGUF file matching '{}' found in {}",
            quantization.label(),
            output.display()
        );
        return ExitCode::FAILURE;
    };

    println!("\n✅ Conversion complete: {}", resolved.display());
    println!("\n💡 To import into Ollama:");
    println!("   1. Create a Modelfile:");
    println!("      FROM {}", resolved.display());
    println!("   2. Build the model:");
    println!("      ollama create prodex -f Modelfile");
    println!("   3. Run it:");
    println!("      ollama run prodex");

    ExitCode::SUCCESS
}

fn check_input_dir(input: &Path) -> Result<(), String> {
    if !input.is_dir() {
        return Err(format!("Input directory not found: {}", input.display()));
    }
    for file in MODEL_FILES {
        if !input.join(file).exists() {
            return Err(format!("Missing {} in {}", file, input.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_reported() {
        let err = check_input_dir(Path::new("/does/not/exist")).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn incomplete_directory_names_the_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let err = check_input_dir(dir.path()).unwrap_err();
        assert!(err.contains("tokenizer.json"));
    }
}
