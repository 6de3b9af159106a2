//! Train command implementation

use crate::commands::resolve_model_dir;
use crate::error::CliError;
use crate::meta::RunMetadata;
use candle_nn::VarMap;
use prodex_candle::{
    DeviceProfile, GenerateOptions, LoraLlama, LoraSpec, ModelAssets, Quantization, export_gguf,
    smoke_test, train,
};
use prodex_core::{ProductExample, RunConfig, load_examples, render_prompt, to_json_text};
use std::path::PathBuf;

#[allow(clippy::too_many_arguments)]
pub async fn run_train(
    data: PathBuf,
    model: String,
    output: PathBuf,
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    quantization: Quantization,
    test_only: bool,
    no_export: bool,
) -> Result<(), CliError> {
    println!("🚀 Starting LoRA fine-tuning...\n");

    let profile = DeviceProfile::detect()?;
    if profile.is_accelerated() {
        println!("⚡ GPU detected, training on CUDA");
    } else {
        println!("🐢 No GPU detected, training on CPU (this will be slow)");
    }

    let examples = load_examples(&data)?;
    println!("📁 Loaded {} examples from {}", examples.len(), data.display());
    if let Some(first) = examples.first() {
        let (input, output) = sample_summary(first)?;
        println!("  Sample input: {input}");
        println!("  Sample output: {output}");
    }

    let prompts = examples
        .iter()
        .map(render_prompt)
        .collect::<Result<Vec<String>, _>>()?;

    let model_dir = resolve_model_dir(&model).await?;
    println!("🤖 Loading base model from {}", model_dir.display());
    let assets = ModelAssets::load(&model_dir, &profile)?;

    let spec = LoraSpec::default();
    let varmap = VarMap::new();
    let mut llama = LoraLlama::from_assets(&assets, &varmap, &spec, &profile)?;
    println!(
        "🔧 LoRA adapters attached (rank {}, alpha {})",
        spec.rank, spec.alpha
    );

    std::fs::create_dir_all(&output)?;
    let run = RunConfig {
        data_path: data.clone(),
        output_dir: output.clone(),
        epochs,
        batch_size,
        learning_rate,
    };

    if test_only {
        println!("\n🧪 Test-only mode, skipping training");
    } else {
        println!("\n🎯 Training for {epochs} epoch(s)...");
        let report = train(&mut llama, &assets.tokenizer, &prompts, &run, &varmap)?;
        println!(
            "\n✅ Training finished: {} optimizer steps, final loss {:.4}",
            report.optimizer_steps, report.final_loss
        );
        println!("📁 Adapter saved to {}", output.join("adapter.safetensors").display());

        RunMetadata::new("prodex", &model, &spec, &run).save(&output)?;
    }

    println!("\n{}", "=".repeat(60));
    println!("🧪 Smoke test");
    println!("{}", "=".repeat(60));
    smoke_test(&mut llama, &assets.tokenizer, None, &GenerateOptions::default())?;
    println!("{}", "=".repeat(60));

    if test_only || no_export {
        println!("\n✅ Done!");
        return Ok(());
    }

    println!("\n📦 Exporting GGUF ({quantization})...");
    let adapter = output.join("adapter.safetensors");
    let adapter = adapter.exists().then_some(adapter);
    let report = export_gguf(&model_dir, adapter.as_deref(), &output.join("gguf"), quantization)?;
    for (path, size) in &report.files {
        println!("  {} ({:.2} GB)", path.display(), *size as f64 / 1e9);
    }
    match &report.resolved {
        Some(path) => println!("✅ GGUF ready: {}", path.display()),
        None => println!(
            "⚠️  No GGUF file matching '{}' found after export",
            quantization.label()
        ),
    }

    println!("\n✅ Done!");
    Ok(())
}

/// First-example echo: input truncated to 100 chars, output as JSON.
fn sample_summary(example: &ProductExample) -> Result<(String, String), CliError> {
    let input: String = example.input.chars().take(100).collect();
    let output = to_json_text(&example.output)?;
    Ok((input, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sample_summary_truncates_input_and_renders_output() {
        let example = ProductExample {
            input: "x".repeat(150),
            output: json!({"name": "Phone", "preis": 599}),
        };

        let (input, output) = sample_summary(&example).unwrap();
        assert_eq!(input.chars().count(), 100);
        assert_eq!(output, r#"{"name": "Phone", "preis": 599}"#);
    }

    #[test]
    fn short_inputs_pass_through_unchanged() {
        let example = ProductExample {
            input: "<div>Tablet</div>".to_string(),
            output: json!({"name": "Tablet"}),
        };

        let (input, _) = sample_summary(&example).unwrap();
        assert_eq!(input, "<div>Tablet</div>");
    }
}
