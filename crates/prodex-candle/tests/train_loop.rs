//! End-to-end training loop test on a miniature randomly initialized model.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use prodex_candle::error::ModelError;
use prodex_candle::model::{LoraLlama, ModelConfig};
use prodex_candle::lora::LoraSpec;
use prodex_candle::train::{KEEP_CHECKPOINTS, train_on_sequences};
use prodex_core::RunConfig;
use std::collections::HashMap;

fn tiny_config() -> ModelConfig {
    ModelConfig {
        hidden_size: 16,
        intermediate_size: 32,
        vocab_size: 32,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        rms_norm_eps: 1e-5,
        rope_theta: 10_000.0,
        max_position_embeddings: 64,
        tie_word_embeddings: false,
    }
}

fn tiny_weights(cfg: &ModelConfig, device: &Device) -> HashMap<String, Tensor> {
    let mut weights = HashMap::new();
    let mut randn = |name: &str, shape: (usize, usize)| {
        let t = Tensor::randn(0f32, 0.02, shape, device).unwrap();
        weights.insert(name.to_string(), t);
    };

    randn("model.embed_tokens.weight", (cfg.vocab_size, cfg.hidden_size));
    randn("lm_head.weight", (cfg.vocab_size, cfg.hidden_size));

    for i in 0..cfg.num_hidden_layers {
        let p = format!("model.layers.{i}");
        randn(&format!("{p}.self_attn.q_proj.weight"), (cfg.hidden_size, cfg.hidden_size));
        randn(&format!("{p}.self_attn.k_proj.weight"), (cfg.kv_dim(), cfg.hidden_size));
        randn(&format!("{p}.self_attn.v_proj.weight"), (cfg.kv_dim(), cfg.hidden_size));
        randn(&format!("{p}.self_attn.o_proj.weight"), (cfg.hidden_size, cfg.hidden_size));
        randn(&format!("{p}.mlp.gate_proj.weight"), (cfg.intermediate_size, cfg.hidden_size));
        randn(&format!("{p}.mlp.up_proj.weight"), (cfg.intermediate_size, cfg.hidden_size));
        randn(&format!("{p}.mlp.down_proj.weight"), (cfg.hidden_size, cfg.intermediate_size));
    }

    let ones = |n: usize| Tensor::ones(n, DType::F32, device).unwrap();
    weights.insert("model.norm.weight".to_string(), ones(cfg.hidden_size));
    for i in 0..cfg.num_hidden_layers {
        let p = format!("model.layers.{i}");
        weights.insert(format!("{p}.input_layernorm.weight"), ones(cfg.hidden_size));
        weights.insert(
            format!("{p}.post_attention_layernorm.weight"),
            ones(cfg.hidden_size),
        );
    }
    weights
}

#[test]
fn training_moves_the_adapter_and_writes_checkpoints() {
    let device = Device::Cpu;
    let cfg = tiny_config();
    let weights = tiny_weights(&cfg, &device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
    let lvb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let spec = LoraSpec {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
    };
    let mut model = LoraLlama::load(vb, lvb, &spec, &cfg, &device, DType::F32).unwrap();

    let sequences: Vec<Vec<u32>> = (0..6)
        .map(|s| (0..10u32).map(|i| (s * 7 + i * 3) % 32).collect())
        .collect();

    let out = tempfile::tempdir().unwrap();
    let run = RunConfig {
        data_path: out.path().join("unused.json"),
        output_dir: out.path().to_path_buf(),
        epochs: 3,
        batch_size: 2,
        learning_rate: 1e-3,
    };

    let report = train_on_sequences(&mut model, &sequences, 0, &run, &varmap).unwrap();

    // 3 batches per epoch flush into 1 optimizer step, once per epoch.
    assert_eq!(report.optimizer_steps, 3);
    assert!(report.final_loss.is_finite());
    assert!(out.path().join("adapter.safetensors").exists());

    let checkpoints: Vec<_> = std::fs::read_dir(out.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("checkpoint-epoch-")
        })
        .collect();
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.len() <= KEEP_CHECKPOINTS);

    // At least one B matrix must have moved off its zero init.
    let data = varmap.data().lock().unwrap();
    let moved = data
        .iter()
        .filter(|(name, _)| name.ends_with(".lora_b.weight"))
        .any(|(_, var)| {
            var.as_tensor()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
                > 0.0
        });
    assert!(moved);
}

#[test]
fn an_empty_sequence_set_is_rejected_up_front() {
    let device = Device::Cpu;
    let cfg = tiny_config();
    let weights = tiny_weights(&cfg, &device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
    let lvb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let spec = LoraSpec {
        rank: 4,
        alpha: 8.0,
        dropout: 0.0,
    };
    let mut model = LoraLlama::load(vb, lvb, &spec, &cfg, &device, DType::F32).unwrap();

    let out = tempfile::tempdir().unwrap();
    let run = RunConfig {
        data_path: out.path().join("unused.json"),
        output_dir: out.path().to_path_buf(),
        epochs: 1,
        batch_size: 2,
        learning_rate: 1e-3,
    };

    let err = train_on_sequences(&mut model, &[], 0, &run, &varmap).unwrap_err();
    assert!(matches!(err, ModelError::NoTrainableSequences));
    assert!(!out.path().join("adapter.safetensors").exists());
}
