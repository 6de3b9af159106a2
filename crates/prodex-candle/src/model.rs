//! Llama-family model with trainable LoRA projections
//!
//! The base weights stay frozen tensors loaded from safetensors; the adapter
//! A/B pairs live in a `VarMap` so the optimizer only ever sees them.

use crate::device::DeviceProfile;
use crate::error::ModelError;
use crate::lora::{LoraLinear, LoraSpec};
use candle_core::{D, DType, Device, Result as CandleResult, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, embedding, linear_no_bias as linear};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Sequence length cap for training and generation, independent of what the
/// base model advertises.
pub const MAX_SEQ_LEN: usize = 2048;

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_norm_eps() -> f64 {
    1e-5
}

fn default_max_pos() -> usize {
    MAX_SEQ_LEN
}

/// Model shape parsed from the Hugging Face `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_pos")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim()
    }

    pub fn seq_len(&self) -> usize {
        self.max_position_embeddings.min(MAX_SEQ_LEN)
    }

    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ModelError::Config(e.to_string()))
    }
}

/// Everything loaded from a model directory: config, tokenizer, raw weights.
pub struct ModelAssets {
    pub config: ModelConfig,
    pub tokenizer: Tokenizer,
    pub weights: HashMap<String, Tensor>,
    pub model_dir: PathBuf,
}

impl ModelAssets {
    /// Load `config.json`, `tokenizer.json` and `model.safetensors` from a
    /// model directory.
    pub fn load(model_dir: &Path, profile: &DeviceProfile) -> Result<Self, ModelError> {
        for file in ["config.json", "tokenizer.json", "model.safetensors"] {
            let path = model_dir.join(file);
            if !path.exists() {
                return Err(ModelError::MissingFile(path));
            }
        }

        let config = ModelConfig::from_file(&model_dir.join("config.json"))?;
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))?;
        let weights =
            candle_core::safetensors::load(model_dir.join("model.safetensors"), &profile.device)?;

        Ok(Self {
            config,
            tokenizer,
            weights,
            model_dir: model_dir.to_path_buf(),
        })
    }
}

/// RMS normalization built from primitive ops so gradients flow through it.
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let norm = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(norm + self.eps)?.sqrt()?)?;
        x.to_dtype(dtype)?
            .broadcast_mul(&self.weight.to_dtype(dtype)?)
    }
}

/// Rotary embedding tables and the optional KV cache.
pub struct Cache {
    use_kv_cache: bool,
    kvs: Vec<Option<(Tensor, Tensor)>>,
    cos: Tensor,
    sin: Tensor,
}

impl Cache {
    fn new(cfg: &ModelConfig, device: &Device, dtype: DType) -> CandleResult<Self> {
        let head_dim = cfg.head_dim();
        let theta: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / cfg.rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        let theta = Tensor::new(theta.as_slice(), device)?;
        let idx_theta = Tensor::arange(0u32, cfg.seq_len() as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((cfg.seq_len(), 1))?
            .matmul(&theta.reshape((1, theta.elem_count()))?)?;
        // Duplicate so cos/sin cover the full head dimension.
        let idx_theta = Tensor::cat(&[&idx_theta, &idx_theta], D::Minus1)?;
        let cos = idx_theta.cos()?.to_dtype(dtype)?;
        let sin = idx_theta.sin()?.to_dtype(dtype)?;

        Ok(Self {
            use_kv_cache: false,
            kvs: vec![None; cfg.num_hidden_layers],
            cos,
            sin,
        })
    }

    fn reset(&mut self) {
        for kv in self.kvs.iter_mut() {
            *kv = None;
        }
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> CandleResult<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

struct CausalSelfAttention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    n_head: usize,
    n_kv_head: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn load(
        vb: VarBuilder,
        lvb: VarBuilder,
        spec: &LoraSpec,
        cfg: &ModelConfig,
    ) -> CandleResult<Self> {
        let dim = cfg.hidden_size;
        let kv_dim = cfg.kv_dim();

        let q_proj = LoraLinear::new(
            linear(dim, dim, vb.pp("q_proj"))?,
            dim,
            dim,
            spec,
            lvb.pp("q_proj"),
        )?;
        let k_proj = LoraLinear::new(
            linear(dim, kv_dim, vb.pp("k_proj"))?,
            dim,
            kv_dim,
            spec,
            lvb.pp("k_proj"),
        )?;
        let v_proj = LoraLinear::new(
            linear(dim, kv_dim, vb.pp("v_proj"))?,
            dim,
            kv_dim,
            spec,
            lvb.pp("v_proj"),
        )?;
        let o_proj = LoraLinear::new(
            linear(dim, dim, vb.pp("o_proj"))?,
            dim,
            dim,
            spec,
            lvb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_head: cfg.num_attention_heads,
            n_kv_head: cfg.num_key_value_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (b_sz, seq_len, n_embd) = x.dims3()?;

        let q = self.q_proj.forward(x, train)?;
        let k = self.k_proj.forward(x, train)?;
        let v = self.v_proj.forward(x, train)?;

        let q = q
            .reshape((b_sz, seq_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.n_kv_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut v = v
            .reshape((b_sz, seq_len, self.n_kv_head, self.head_dim))?
            .transpose(1, 2)?;

        let q = self.apply_rotary_emb(&q, index_pos, cache)?;
        let mut k = self.apply_rotary_emb(&k, index_pos, cache)?;

        if cache.use_kv_cache {
            if let Some((k_cache, v_cache)) = &cache.kvs[block_idx] {
                k = Tensor::cat(&[k_cache, &k], 2)?.contiguous()?;
                v = Tensor::cat(&[v_cache, &v], 2)?.contiguous()?;
            }
            cache.kvs[block_idx] = Some((k.clone(), v.clone()));
        }

        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;

        // Attention runs in F32 regardless of the model dtype.
        let in_dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;

        let scale = 1f64 / (self.head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?)? * scale)?;

        let att = if seq_len == 1 {
            att
        } else {
            let (_, _, query_len, key_len) = att.dims4()?;
            let mask_data: Vec<u8> = (0..query_len)
                .flat_map(|i| {
                    (0..key_len).map(move |j| {
                        let current_pos = key_len - query_len + i;
                        u8::from(j > current_pos)
                    })
                })
                .collect();
            let mask = Tensor::from_slice(&mask_data, (query_len, key_len), att.device())?
                .broadcast_as(att.shape())?;
            masked_fill(&att, &mask, f32::NEG_INFINITY)?
        };

        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let out = att.matmul(&v.contiguous()?)?;
        let out = out
            .to_dtype(in_dtype)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, n_embd))?;
        self.o_proj.forward(&out, train)
    }

    fn apply_rotary_emb(
        &self,
        x: &Tensor,
        index_pos: usize,
        cache: &Cache,
    ) -> CandleResult<Tensor> {
        let (b_sz, _n_head, seq_len, head_dim) = x.dims4()?;
        let cos = cache.cos.narrow(0, index_pos, seq_len)?;
        let sin = cache.sin.narrow(0, index_pos, seq_len)?;
        let cos = cos.broadcast_as((b_sz, 1, seq_len, head_dim))?;
        let sin = sin.broadcast_as((b_sz, 1, seq_len, head_dim))?;

        let x1 = x.narrow(D::Minus1, 0, head_dim / 2)?;
        let x2 = x.narrow(D::Minus1, head_dim / 2, head_dim / 2)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }

    fn repeat_kv(&self, x: Tensor) -> CandleResult<Tensor> {
        if self.n_kv_head == self.n_head {
            Ok(x)
        } else {
            let (b_sz, n_kv_head, seq_len, head_dim) = x.dims4()?;
            let n_rep = self.n_head / self.n_kv_head;
            x.unsqueeze(2)?
                .expand((b_sz, n_kv_head, n_rep, seq_len, head_dim))?
                .reshape((b_sz, n_kv_head * n_rep, seq_len, head_dim))
        }
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(
        vb: VarBuilder,
        lvb: VarBuilder,
        spec: &LoraSpec,
        cfg: &ModelConfig,
    ) -> CandleResult<Self> {
        let h = cfg.hidden_size;
        let i = cfg.intermediate_size;
        let gate_proj = LoraLinear::new(
            linear(h, i, vb.pp("gate_proj"))?,
            h,
            i,
            spec,
            lvb.pp("gate_proj"),
        )?;
        let up_proj = LoraLinear::new(
            linear(h, i, vb.pp("up_proj"))?,
            h,
            i,
            spec,
            lvb.pp("up_proj"),
        )?;
        let down_proj = LoraLinear::new(
            linear(i, h, vb.pp("down_proj"))?,
            i,
            h,
            spec,
            lvb.pp("down_proj"),
        )?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let gate = self.gate_proj.forward(x, train)?;
        let gate = (&gate / (gate.neg()?.exp()? + 1.0)?)?;
        let x = (gate * self.up_proj.forward(x, train)?)?;
        self.down_proj.forward(&x, train)
    }
}

struct Block {
    rms_1: RmsNorm,
    attn: CausalSelfAttention,
    rms_2: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn load(
        vb: VarBuilder,
        lvb: VarBuilder,
        spec: &LoraSpec,
        cfg: &ModelConfig,
    ) -> CandleResult<Self> {
        let rms_1 = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let rms_2 = RmsNorm::load(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let attn = CausalSelfAttention::load(vb.pp("self_attn"), lvb.pp("self_attn"), spec, cfg)?;
        let mlp = Mlp::load(vb.pp("mlp"), lvb.pp("mlp"), spec, cfg)?;
        Ok(Self {
            rms_1,
            attn,
            rms_2,
            mlp,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        index_pos: usize,
        block_idx: usize,
        cache: &mut Cache,
        train: bool,
    ) -> CandleResult<Tensor> {
        let residual = x;
        let x = self.rms_1.forward(x)?;
        let x = (self.attn.forward(&x, index_pos, block_idx, cache, train)? + residual)?;
        let residual = &x;
        let x = (self.mlp.forward(&self.rms_2.forward(&x)?, train)? + residual)?;
        Ok(x)
    }
}

/// The adapted model: frozen llama weights plus trainable LoRA projections.
pub struct LoraLlama {
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: RmsNorm,
    lm_head: Linear,
    cache: Cache,
    config: ModelConfig,
    device: Device,
}

impl LoraLlama {
    /// Build the model from loaded assets, allocating adapters in `varmap`.
    pub fn from_assets(
        assets: &ModelAssets,
        varmap: &candle_nn::VarMap,
        spec: &LoraSpec,
        profile: &DeviceProfile,
    ) -> Result<Self, ModelError> {
        let vb = VarBuilder::from_tensors(assets.weights.clone(), profile.dtype, &profile.device);
        let lvb = VarBuilder::from_varmap(varmap, profile.dtype, &profile.device);
        Self::load(vb, lvb, spec, &assets.config, &profile.device, profile.dtype)
    }

    pub fn load(
        vb: VarBuilder,
        lvb: VarBuilder,
        spec: &LoraSpec,
        cfg: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let wte = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;

        let mut blocks = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            let block = Block::load(
                vb.pp(format!("model.layers.{idx}")),
                lvb.pp(format!("model.layers.{idx}")),
                spec,
                cfg,
            )?;
            blocks.push(block);
        }

        let ln_f = RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(wte.embeddings().clone(), None)
        } else {
            linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        let cache = Cache::new(cfg, device, dtype)?;

        Ok(Self {
            wte,
            blocks,
            ln_f,
            lm_head,
            cache,
            config: cfg.clone(),
            device: device.clone(),
        })
    }

    /// Full forward pass, logits over the whole sequence.
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        index_pos: usize,
        train: bool,
    ) -> Result<Tensor, ModelError> {
        let mut x = self.wte.forward(input_ids)?;
        for (block_idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x, index_pos, block_idx, &mut self.cache, train)?;
        }
        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;
        Ok(logits)
    }

    /// Turn KV caching on (generation) or off (training).
    pub fn set_kv_cache(&mut self, enabled: bool) {
        self.cache.use_kv_cache = enabled;
        self.cache.reset();
    }

    /// Drop any cached keys/values, e.g. between prompts.
    pub fn reset_cache(&mut self) {
        self.cache.reset();
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
