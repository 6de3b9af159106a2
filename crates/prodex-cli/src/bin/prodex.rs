//! Fine-tune a small language model on product description examples

use clap::Parser;
use prodex_candle::Quantization;
use prodex_cli::error::CliError;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "prodex")]
#[command(about = "LoRA fine-tuning for German product descriptions", long_about = None)]
struct Cli {
    /// Path to the training data JSON file
    #[arg(long, short = 'd', default_value = "produktdaten.json")]
    data: PathBuf,

    /// Base model (local directory or HuggingFace repo id)
    #[arg(long, short = 'm', default_value = "TinyLlama/TinyLlama-1.1B-Chat-v1.0")]
    model: String,

    /// Output directory for the trained adapter
    #[arg(long, short = 'o', default_value = "output")]
    output: PathBuf,

    /// Number of training epochs
    #[arg(long, short = 'e', default_value = "3")]
    epochs: usize,

    /// Batch size
    #[arg(long, default_value = "2")]
    batch_size: usize,

    /// Learning rate
    #[arg(long, default_value = "2e-4")]
    learning_rate: f64,

    /// Quantization for the GGUF export (q4_k_m, q5_k_m, q8_0)
    #[arg(long, short = 'q', default_value = "q4_k_m")]
    quantization: Quantization,

    /// Skip training, only load the model and run the smoke test
    #[arg(long)]
    test_only: bool,

    /// Skip the GGUF export after training
    #[arg(long)]
    no_export: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    prodex_cli::commands::run_train(
        cli.data,
        cli.model,
        cli.output,
        cli.epochs,
        cli.batch_size,
        cli.learning_rate,
        cli.quantization,
        cli.test_only,
        cli.no_export,
    )
    .await?;

    Ok(())
}
