//! Trainable low-rank adapters over frozen linear layers

use candle_core::{Result as CandleResult, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Fixed adapter hyperparameters for a run.
#[derive(Debug, Clone, Copy)]
pub struct LoraSpec {
    /// Adapter rank; higher means more capacity and more memory.
    pub rank: usize,
    /// Scaling factor, conventionally twice the rank.
    pub alpha: f64,
    /// Dropout on the adapter input during training.
    pub dropout: f32,
}

impl Default for LoraSpec {
    fn default() -> Self {
        Self {
            rank: 64,
            alpha: 128.0,
            dropout: 0.0,
        }
    }
}

impl LoraSpec {
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// A frozen linear layer with a trainable low-rank delta.
///
/// Forward is `x·Wᵀ + scale · (x·Aᵀ)·Bᵀ`. `B` starts at zero, so the adapted
/// layer equals the base layer until training moves it.
pub struct LoraLinear {
    base: Linear,
    lora_a: Linear,
    lora_b: Linear,
    scale: f64,
    dropout: f32,
}

impl LoraLinear {
    /// Wrap a frozen base layer, allocating the A/B pair in `vb` (the
    /// trainable variable set).
    pub fn new(
        base: Linear,
        in_dim: usize,
        out_dim: usize,
        spec: &LoraSpec,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        let init_a = Init::Randn {
            mean: 0.0,
            stdev: 1.0 / spec.rank as f64,
        };
        let a = vb.get_with_hints((spec.rank, in_dim), "lora_a.weight", init_a)?;
        let b = vb.get_with_hints((out_dim, spec.rank), "lora_b.weight", Init::Const(0.0))?;
        Ok(Self {
            base,
            lora_a: Linear::new(a, None),
            lora_b: Linear::new(b, None),
            scale: spec.scale(),
            dropout: spec.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let base = self.base.forward(x)?;
        let h = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(x, self.dropout)?
        } else {
            x.clone()
        };
        let delta = (self.lora_b.forward(&self.lora_a.forward(&h)?)? * self.scale)?;
        base + delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn scale_is_alpha_over_rank() {
        let spec = LoraSpec::default();
        assert_eq!(spec.scale(), 2.0);
    }

    #[test]
    fn zero_initialized_adapter_is_identity_on_the_base() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let weight = Tensor::randn(0f32, 1f32, (6, 4), &device).unwrap();
        let base = Linear::new(weight, None);
        let spec = LoraSpec {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
        };
        let layer = LoraLinear::new(base.clone(), 4, 6, &spec, vb.pp("test")).unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap();
        let adapted = layer.forward(&x, false).unwrap();
        let plain = base.forward(&x).unwrap();

        let diff = (adapted - plain)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn adapter_variables_land_in_the_varmap() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let weight = Tensor::zeros((6, 4), DType::F32, &device).unwrap();
        let spec = LoraSpec {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
        };
        LoraLinear::new(Linear::new(weight, None), 4, 6, &spec, vb.pp("q_proj")).unwrap();

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "q_proj.lora_a.weight"));
        assert!(names.iter().any(|n| n == "q_proj.lora_b.weight"));
    }
}
