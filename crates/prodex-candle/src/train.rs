//! LoRA training loop
//!
//! Only the adapter variables in the `VarMap` receive gradients; the base
//! model weights are plain tensors and never move.

use crate::error::ModelError;
use crate::model::{LoraLlama, MAX_SEQ_LEN};
use candle_core::{D, DType, Tensor};
use candle_nn::{Optimizer, VarMap, loss};
use candle_nn::optim::{AdamW, ParamsAdamW};
use prodex_core::RunConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use tokenizers::Tokenizer;

/// Micro-batches averaged into one optimizer step.
pub const GRAD_ACCUM_STEPS: usize = 4;
/// Optimizer steps spent ramping the learning rate up from zero.
pub const WARMUP_STEPS: usize = 10;
/// AdamW decoupled weight decay.
pub const WEIGHT_DECAY: f64 = 0.01;
/// Console log cadence, in optimizer steps.
pub const LOG_EVERY: usize = 25;
/// Shuffle seed, offset per epoch.
pub const SEED: u64 = 3407;
/// Epoch checkpoints retained on disk.
pub const KEEP_CHECKPOINTS: usize = 2;

/// What the loop did, for the caller's summary line.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub optimizer_steps: usize,
    pub final_loss: f64,
}

/// Learning rate at `step`: linear warmup, then linear decay to zero.
pub fn lr_at(step: usize, total_steps: usize, base: f64) -> f64 {
    if step < WARMUP_STEPS {
        return base * (step + 1) as f64 / WARMUP_STEPS as f64;
    }
    if total_steps <= WARMUP_STEPS {
        return base;
    }
    let remaining = total_steps.saturating_sub(step) as f64;
    let span = (total_steps - WARMUP_STEPS) as f64;
    base * (remaining / span).max(0.0)
}

/// Tokenize rendered prompts and run the training loop over them.
pub fn train(
    model: &mut LoraLlama,
    tokenizer: &Tokenizer,
    prompts: &[String],
    run: &RunConfig,
    varmap: &VarMap,
) -> Result<TrainReport, ModelError> {
    let pad_id = crate::generate::eos_id(tokenizer);
    let mut sequences = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let encoding = tokenizer.encode(prompt.as_str(), true)?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(MAX_SEQ_LEN);
        if ids.len() >= 2 {
            sequences.push(ids);
        }
    }
    train_on_sequences(model, &sequences, pad_id, run, varmap)
}

/// The actual loop, separated out so tests can feed synthetic token ids.
pub fn train_on_sequences(
    model: &mut LoraLlama,
    sequences: &[Vec<u32>],
    pad_id: u32,
    run: &RunConfig,
    varmap: &VarMap,
) -> Result<TrainReport, ModelError> {
    if sequences.is_empty() {
        return Err(ModelError::NoTrainableSequences);
    }
    model.set_kv_cache(false);

    // Pending micro-batches are flushed at every epoch boundary, so each
    // epoch contributes ceil(batches / accum) optimizer steps.
    let batches_per_epoch = sequences.len().div_ceil(run.batch_size);
    let steps_per_epoch = batches_per_epoch.div_ceil(GRAD_ACCUM_STEPS);
    let total_steps = (run.epochs * steps_per_epoch).max(1);

    let params = ParamsAdamW {
        lr: lr_at(0, total_steps, run.learning_rate),
        weight_decay: WEIGHT_DECAY,
        ..Default::default()
    };
    let mut opt = AdamW::new(varmap.all_vars(), params)?;

    let mut step = 0usize;
    let mut final_loss = f64::NAN;
    let mut pending: Vec<Tensor> = Vec::with_capacity(GRAD_ACCUM_STEPS);
    let mut order: Vec<usize> = (0..sequences.len()).collect();

    for epoch in 0..run.epochs {
        let mut rng = StdRng::seed_from_u64(SEED + epoch as u64);
        order.shuffle(&mut rng);
        println!("📖 Epoch {}/{}", epoch + 1, run.epochs);

        for chunk in order.chunks(run.batch_size) {
            let batch: Vec<&[u32]> = chunk.iter().map(|&i| sequences[i].as_slice()).collect();
            let (inputs, targets, valid) = build_batch(&batch, pad_id, model)?;
            let logits = model.forward(&inputs, 0, true)?;
            let batch_loss = masked_loss(&logits, &targets, &valid)?;
            pending.push(batch_loss);

            if pending.len() == GRAD_ACCUM_STEPS {
                step += 1;
                final_loss = apply_step(&mut opt, &mut pending, step, total_steps, run)?;
            }
        }

        if !pending.is_empty() {
            step += 1;
            final_loss = apply_step(&mut opt, &mut pending, step, total_steps, run)?;
        }

        save_checkpoint(varmap, &run.output_dir, epoch + 1)?;
    }

    varmap.save(run.output_dir.join("adapter.safetensors"))?;

    Ok(TrainReport {
        optimizer_steps: step,
        final_loss,
    })
}

fn apply_step(
    opt: &mut AdamW,
    pending: &mut Vec<Tensor>,
    step: usize,
    total_steps: usize,
    run: &RunConfig,
) -> Result<f64, ModelError> {
    let n = pending.len();
    let mut sum = pending[0].clone();
    for loss in pending.iter().skip(1) {
        sum = (sum + loss)?;
    }
    let mean = (sum / n as f64)?;

    let lr = lr_at(step - 1, total_steps, run.learning_rate);
    opt.set_learning_rate(lr);
    opt.backward_step(&mean)?;
    pending.clear();

    let loss = mean.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
    if step % LOG_EVERY == 0 || step == total_steps {
        println!("  step {step:>4}/{total_steps} | loss {loss:.4} | lr {lr:.6}");
    }
    Ok(loss)
}

/// Right-pad a batch to a common length and shift it into inputs/targets.
///
/// Returns the flat indices of positions whose target token is real, so the
/// loss never trains on padding.
fn build_batch(
    batch: &[&[u32]],
    pad_id: u32,
    model: &LoraLlama,
) -> Result<(Tensor, Tensor, Tensor), ModelError> {
    let width = batch
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or(2)
        .min(model.config().seq_len());
    let t = width - 1;

    let mut inputs = Vec::with_capacity(batch.len() * t);
    let mut targets = Vec::with_capacity(batch.len() * t);
    let mut valid = Vec::new();

    for (row, seq) in batch.iter().enumerate() {
        let seq = &seq[..seq.len().min(width)];
        for pos in 0..t {
            inputs.push(*seq.get(pos).unwrap_or(&pad_id));
            let target = seq.get(pos + 1);
            targets.push(*target.unwrap_or(&pad_id));
            if target.is_some() {
                valid.push((row * t + pos) as u32);
            }
        }
    }

    let device = model.device();
    let inputs = Tensor::from_vec(inputs, (batch.len(), t), device)?;
    let targets = Tensor::from_vec(targets, (batch.len(), t), device)?;
    let n_valid = valid.len();
    let valid = Tensor::from_vec(valid, n_valid, device)?;
    Ok((inputs, targets, valid))
}

/// Cross entropy over the valid positions only, computed in F32.
fn masked_loss(logits: &Tensor, targets: &Tensor, valid: &Tensor) -> Result<Tensor, ModelError> {
    let (b, t, vocab) = logits.dims3()?;
    let flat = logits.reshape((b * t, vocab))?.to_dtype(DType::F32)?;
    let picked = flat.index_select(valid, 0)?;
    let target_flat = targets.reshape(b * t)?.index_select(valid, 0)?;
    Ok(loss::cross_entropy(&picked, &target_flat)?)
}

/// Write the adapter for this epoch and drop checkpoints beyond the last few.
fn save_checkpoint(varmap: &VarMap, output_dir: &Path, epoch: usize) -> Result<(), ModelError> {
    let dir = output_dir.join(format!("checkpoint-epoch-{epoch}"));
    std::fs::create_dir_all(&dir)?;
    varmap.save(dir.join("adapter.safetensors"))?;

    let mut checkpoints: Vec<(usize, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = name.strip_prefix("checkpoint-epoch-") {
            if let Ok(n) = n.parse::<usize>() {
                checkpoints.push((n, entry.path()));
            }
        }
    }
    checkpoints.sort_by_key(|(n, _)| *n);
    while checkpoints.len() > KEEP_CHECKPOINTS {
        let (_, path) = checkpoints.remove(0);
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_ramps_linearly_from_zero() {
        let base = 2e-4;
        assert!(lr_at(0, 100, base) < lr_at(5, 100, base));
        assert!((lr_at(9, 100, base) - base).abs() < 1e-12);
    }

    #[test]
    fn decay_reaches_zero_at_the_last_step() {
        let base = 2e-4;
        let lr = lr_at(100, 100, base);
        assert!(lr.abs() < 1e-12);
        assert!(lr_at(50, 100, base) > lr_at(90, 100, base));
    }

    #[test]
    fn steps_past_the_planned_end_clamp_to_zero() {
        let base = 2e-4;
        let lr = lr_at(14, 13, base);
        assert_eq!(lr, 0.0);
        assert_eq!(lr_at(200, 13, base), 0.0);
    }

    #[test]
    fn epoch_boundary_flushes_are_counted_in_the_plan() {
        // 34 examples, batch 2, 3 epochs: 17 batches per epoch flush into
        // 5 optimizer steps each, so the plan must cover 15 steps.
        let batches_per_epoch = 34usize.div_ceil(2);
        let steps_per_epoch = batches_per_epoch.div_ceil(GRAD_ACCUM_STEPS);
        let total_steps = 3 * steps_per_epoch;
        assert_eq!(total_steps, 15);
        for step in 0..total_steps {
            assert!(lr_at(step, total_steps, 2e-4).is_finite());
        }
    }

    #[test]
    fn short_runs_never_divide_by_zero() {
        let base = 2e-4;
        for step in 0..8 {
            let lr = lr_at(step, 8, base);
            assert!(lr.is_finite());
            assert!(lr >= 0.0);
            assert!(lr <= base);
        }
    }
}
