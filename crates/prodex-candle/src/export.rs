//! GGUF export: merge the trained adapter into the base weights, quantize,
//! and write a llama.cpp-compatible file Ollama can import.

use crate::device::DeviceProfile;
use crate::error::ExportError;
use crate::lora::LoraSpec;
use crate::model::ModelAssets;
use candle_core::quantized::{GgmlDType, QTensor, gguf_file};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Supported quantization schemes, labelled the way llama.cpp spells them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    Q4KM,
    Q5KM,
    Q8_0,
}

impl Quantization {
    pub const ALL: [Quantization; 3] = [Quantization::Q4KM, Quantization::Q5KM, Quantization::Q8_0];

    pub fn label(&self) -> &'static str {
        match self {
            Quantization::Q4KM => "q4_k_m",
            Quantization::Q5KM => "q5_k_m",
            Quantization::Q8_0 => "q8_0",
        }
    }

    pub fn ggml_dtype(&self) -> GgmlDType {
        match self {
            Quantization::Q4KM => GgmlDType::Q4K,
            Quantization::Q5KM => GgmlDType::Q5K,
            Quantization::Q8_0 => GgmlDType::Q8_0,
        }
    }
}

impl FromStr for Quantization {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "q4_k_m" => Ok(Quantization::Q4KM),
            "q5_k_m" => Ok(Quantization::Q5KM),
            "q8_0" => Ok(Quantization::Q8_0),
            _ => Err(ExportError::UnknownQuantization(s.to_string())),
        }
    }
}

impl std::fmt::Display for Quantization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// What the export wrote and what a scan of the output directory found.
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// The file this run wrote.
    pub written: PathBuf,
    /// The file in the output directory matching the quantization label,
    /// `None` when the scan came up empty.
    pub resolved: Option<PathBuf>,
    /// Every GGUF file in the output directory with its size in bytes.
    pub files: Vec<(PathBuf, u64)>,
}

/// Convert a model directory (plus an optional trained adapter) to GGUF.
pub fn export_gguf(
    model_dir: &Path,
    adapter: Option<&Path>,
    out_dir: &Path,
    quant: Quantization,
) -> Result<ExportReport, ExportError> {
    let profile = DeviceProfile {
        device: Device::Cpu,
        dtype: DType::F32,
    };
    let assets = ModelAssets::load(model_dir, &profile)?;

    let mut weights: HashMap<String, Tensor> = HashMap::new();
    for (name, tensor) in &assets.weights {
        weights.insert(name.clone(), tensor.to_dtype(DType::F32)?);
    }
    if let Some(adapter) = adapter {
        merge_adapter(&mut weights, adapter)?;
    }

    let mut qtensors: Vec<(String, QTensor)> = Vec::new();
    for (name, tensor) in &weights {
        let Some(gguf_name) = map_tensor_name(name) else {
            continue;
        };
        let dtype = quant_dtype_for(tensor, quant.ggml_dtype());
        qtensors.push((gguf_name, QTensor::quantize(tensor, dtype)?));
    }
    qtensors.sort_by(|(a, _), (b, _)| a.cmp(b));

    let model_name = model_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    let metadata = build_metadata(&assets, &model_name)?;

    std::fs::create_dir_all(out_dir)?;
    let written = out_dir.join(format!("{model_name}-{}.gguf", quant.label()));
    let mut file = std::fs::File::create(&written)?;
    let tensor_refs: Vec<(&str, &QTensor)> = qtensors
        .iter()
        .map(|(name, qt)| (name.as_str(), qt))
        .collect();
    let metadata_refs: Vec<(&str, &gguf_file::Value)> =
        metadata.iter().map(|(k, v)| (*k, v)).collect();
    gguf_file::write(&mut file, metadata_refs.as_slice(), &tensor_refs)?;

    let files = list_gguf_files(out_dir)?;
    let resolved = resolve_artifact(&files, quant.label());

    Ok(ExportReport {
        written,
        resolved,
        files,
    })
}

/// Fold `W + scale·B·A` into every base weight that has an adapter pair.
fn merge_adapter(
    weights: &mut HashMap<String, Tensor>,
    adapter: &Path,
) -> Result<(), ExportError> {
    let adapter = candle_core::safetensors::load(adapter, &Device::Cpu)?;
    let scale = LoraSpec::default().scale();

    for (name, a) in &adapter {
        let Some(prefix) = name.strip_suffix(".lora_a.weight") else {
            continue;
        };
        let Some(b) = adapter.get(&format!("{prefix}.lora_b.weight")) else {
            continue;
        };
        let base_key = format!("{prefix}.weight");
        let Some(base) = weights.get(&base_key) else {
            continue;
        };
        let a = a.to_dtype(DType::F32)?;
        let b = b.to_dtype(DType::F32)?;
        let delta = (b.matmul(&a)? * scale)?;
        weights.insert(base_key, (base + delta)?);
    }
    Ok(())
}

/// HF safetensors name to llama.cpp name, `None` for tensors GGUF drops.
fn map_tensor_name(name: &str) -> Option<String> {
    match name {
        "model.embed_tokens.weight" => return Some("token_embd.weight".to_string()),
        "model.norm.weight" => return Some("output_norm.weight".to_string()),
        "lm_head.weight" => return Some("output.weight".to_string()),
        _ => {}
    }

    let rest = name.strip_prefix("model.layers.")?;
    let (layer, suffix) = rest.split_once('.')?;
    let mapped = match suffix {
        "self_attn.q_proj.weight" => "attn_q.weight",
        "self_attn.k_proj.weight" => "attn_k.weight",
        "self_attn.v_proj.weight" => "attn_v.weight",
        "self_attn.o_proj.weight" => "attn_output.weight",
        "mlp.gate_proj.weight" => "ffn_gate.weight",
        "mlp.up_proj.weight" => "ffn_up.weight",
        "mlp.down_proj.weight" => "ffn_down.weight",
        "input_layernorm.weight" => "attn_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        _ => return None,
    };
    Some(format!("blk.{layer}.{mapped}"))
}

/// Quantize matrices whose rows fit the block size; everything else stays F32.
fn quant_dtype_for(tensor: &Tensor, wanted: GgmlDType) -> GgmlDType {
    let dims = tensor.dims();
    if dims.len() == 2 && dims[1] % wanted.block_size() == 0 {
        wanted
    } else {
        GgmlDType::F32
    }
}

fn build_metadata(
    assets: &ModelAssets,
    model_name: &str,
) -> Result<Vec<(&'static str, gguf_file::Value)>, ExportError> {
    use gguf_file::Value;

    let cfg = &assets.config;
    let tokenizer = &assets.tokenizer;

    let vocab = tokenizer.get_vocab(true);
    let vocab_len = cfg
        .vocab_size
        .max(vocab.values().map(|&id| id as usize + 1).max().unwrap_or(0));
    let mut tokens = vec![String::new(); vocab_len];
    for (token, id) in vocab {
        tokens[id as usize] = token;
    }
    for (id, token) in tokens.iter_mut().enumerate() {
        if token.is_empty() {
            *token = format!("<unused{id}>");
        }
    }

    let bos = tokenizer.token_to_id("<s>").unwrap_or(1);
    let eos = crate::generate::eos_id(tokenizer);
    let token_types: Vec<Value> = (0..tokens.len() as u32)
        .map(|id| Value::I32(if id == bos || id == eos { 3 } else { 1 }))
        .collect();
    let scores: Vec<Value> = (0..tokens.len()).map(|_| Value::F32(0.0)).collect();
    let tokens: Vec<Value> = tokens.into_iter().map(Value::String).collect();

    Ok(vec![
        ("general.architecture", Value::String("llama".to_string())),
        ("general.name", Value::String(model_name.to_string())),
        ("llama.context_length", Value::U32(cfg.max_position_embeddings as u32)),
        ("llama.embedding_length", Value::U32(cfg.hidden_size as u32)),
        ("llama.block_count", Value::U32(cfg.num_hidden_layers as u32)),
        ("llama.feed_forward_length", Value::U32(cfg.intermediate_size as u32)),
        ("llama.attention.head_count", Value::U32(cfg.num_attention_heads as u32)),
        ("llama.attention.head_count_kv", Value::U32(cfg.num_key_value_heads as u32)),
        ("llama.attention.layer_norm_rms_epsilon", Value::F32(cfg.rms_norm_eps as f32)),
        ("llama.rope.freq_base", Value::F32(cfg.rope_theta)),
        ("llama.rope.dimension_count", Value::U32(cfg.head_dim() as u32)),
        ("tokenizer.ggml.model", Value::String("llama".to_string())),
        ("tokenizer.ggml.tokens", Value::Array(tokens)),
        ("tokenizer.ggml.scores", Value::Array(scores)),
        ("tokenizer.ggml.token_type", Value::Array(token_types)),
        ("tokenizer.ggml.bos_token_id", Value::U32(bos)),
        ("tokenizer.ggml.eos_token_id", Value::U32(eos)),
    ])
}

fn list_gguf_files(out_dir: &Path) -> Result<Vec<(PathBuf, u64)>, ExportError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(out_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "gguf") {
            let size = entry.metadata()?.len();
            files.push((path, size));
        }
    }
    files.sort();
    Ok(files)
}

/// Case- and separator-insensitive label match against the scanned files.
pub fn resolve_artifact(files: &[(PathBuf, u64)], label: &str) -> Option<PathBuf> {
    let needle = normalize(label);
    files
        .iter()
        .find(|(path, _)| {
            path.file_name()
                .map(|n| normalize(&n.to_string_lossy()).contains(&needle))
                .unwrap_or(false)
        })
        .map(|(path, _)| path.clone())
}

fn normalize(s: &str) -> String {
    s.to_uppercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_back_to_themselves() {
        for quant in Quantization::ALL {
            assert_eq!(quant.label().parse::<Quantization>().unwrap(), quant);
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "q2_k".parse::<Quantization>().unwrap_err();
        assert!(matches!(err, ExportError::UnknownQuantization(_)));
    }

    #[test]
    fn labels_map_to_the_expected_ggml_dtypes() {
        assert_eq!(Quantization::Q4KM.ggml_dtype(), GgmlDType::Q4K);
        assert_eq!(Quantization::Q5KM.ggml_dtype(), GgmlDType::Q5K);
        assert_eq!(Quantization::Q8_0.ggml_dtype(), GgmlDType::Q8_0);
    }

    #[test]
    fn artifact_resolution_ignores_case_and_separators() {
        let files = vec![
            (PathBuf::from("out/model-f16.gguf"), 10),
            (PathBuf::from("out/Model-Q4_K_M.gguf"), 20),
        ];
        let resolved = resolve_artifact(&files, "q4_k_m").unwrap();
        assert_eq!(resolved, PathBuf::from("out/Model-Q4_K_M.gguf"));
    }

    #[test]
    fn artifact_resolution_reports_missing_matches() {
        let files = vec![(PathBuf::from("out/model-q8_0.gguf"), 10)];
        assert!(resolve_artifact(&files, "q4_k_m").is_none());
    }

    #[test]
    fn hf_names_map_to_llama_cpp_names() {
        assert_eq!(
            map_tensor_name("model.embed_tokens.weight").as_deref(),
            Some("token_embd.weight")
        );
        assert_eq!(
            map_tensor_name("model.layers.3.self_attn.q_proj.weight").as_deref(),
            Some("blk.3.attn_q.weight")
        );
        assert_eq!(
            map_tensor_name("model.layers.0.mlp.down_proj.weight").as_deref(),
            Some("blk.0.ffn_down.weight")
        );
        assert_eq!(map_tensor_name("model.layers.0.rotary.inv_freq"), None);
    }
}
