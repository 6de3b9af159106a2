//! Standalone GGUF converter for already-trained models

use clap::Parser;
use prodex_candle::Quantization;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "prodex-export")]
#[command(about = "Convert a trained model directory to GGUF for Ollama", long_about = None)]
struct Cli {
    /// Model directory (config.json, tokenizer.json, model.safetensors
    /// and optionally adapter.safetensors)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Output directory for the GGUF file
    #[arg(long, short = 'o', default_value = "gguf")]
    output: PathBuf,

    /// Quantization scheme (q4_k_m, q5_k_m, q8_0)
    #[arg(long, short = 'q', default_value = "q4_k_m")]
    quantization: Quantization,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    prodex_cli::commands::run_convert(cli.input, cli.output, cli.quantization).await
}
