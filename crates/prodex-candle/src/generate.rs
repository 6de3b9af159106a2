//! Sampling-based generation for the post-training smoke test

use crate::error::ModelError;
use crate::model::LoraLlama;
use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;
use prodex_core::{INPUT_TAG, OUTPUT_TAG};
use tokenizers::Tokenizer;

/// Built-in German product snippet used when the caller supplies no input.
pub const DEFAULT_SMOKE_INPUT: &str = "<div class=\"produkt\"><h2>Samsung Galaxy Tab A9</h2>\
<p>8,7 Zoll Display, 64 GB Speicher, Android 13.</p>\
<span class=\"preis\">149,99 €</span></div>";

/// Sampling knobs for the smoke test.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            seed: 3407,
        }
    }
}

/// End-of-sequence token id, probing the names llama-family tokenizers use.
pub fn eos_id(tokenizer: &Tokenizer) -> u32 {
    for name in ["</s>", "<|endoftext|>", "<|end_of_text|>"] {
        if let Some(id) = tokenizer.token_to_id(name) {
            return id;
        }
    }
    2
}

/// Generate a structured answer for one raw input, using the KV cache.
///
/// Streams decoded text to stdout as it is produced and returns the full
/// continuation, without the prompt.
pub fn smoke_test(
    model: &mut LoraLlama,
    tokenizer: &Tokenizer,
    input: Option<&str>,
    opts: &GenerateOptions,
) -> Result<String, ModelError> {
    let input = input.unwrap_or(DEFAULT_SMOKE_INPUT);
    let prompt = format!("{INPUT_TAG}{input}\n{OUTPUT_TAG}");

    let limit = model.config().seq_len();
    let encoding = tokenizer.encode(prompt.as_str(), true)?;
    let mut ids = encoding.get_ids().to_vec();
    ids.truncate(limit - 1);

    model.set_kv_cache(true);
    let eos = eos_id(tokenizer);
    let mut sampler = LogitsProcessor::new(opts.seed, Some(opts.temperature), Some(opts.top_p));
    let mut generated: Vec<u32> = Vec::new();
    let mut index_pos = 0usize;
    let mut printed = 0usize;

    for step in 0..opts.max_new_tokens {
        let context: &[u32] = if step == 0 {
            &ids
        } else {
            &ids[ids.len() - 1..]
        };
        if index_pos + context.len() > limit {
            break;
        }
        let input_ids = Tensor::new(context, model.device())?.unsqueeze(0)?;
        let logits = model.forward(&input_ids, index_pos, false)?;
        index_pos += context.len();

        let (_b, t, _vocab) = logits.dims3()?;
        let last = logits.i((0, t - 1))?.to_dtype(DType::F32)?;
        let next = sampler.sample(&last)?;
        if next == eos {
            break;
        }
        generated.push(next);
        ids.push(next);

        // Re-decode and print the stable suffix so merged tokens and partial
        // UTF-8 sequences come out right.
        let decoded = tokenizer.decode(&generated, true)?;
        if decoded.len() > printed && !decoded.ends_with('\u{FFFD}') {
            print!("{}", &decoded[printed..]);
            let _ = std::io::Write::flush(&mut std::io::stdout());
            printed = decoded.len();
        }
    }

    model.set_kv_cache(false);
    println!();
    let text = tokenizer.decode(&generated, true)?;
    Ok(text)
}
