//! Low-rank adapters for linear projections.
//!
//! ```text
//! y = x·Wᵀ + (alpha / r) · (x·Aᵀ)·Bᵀ      A: [r, in]   B: [out, r]
//! ```
//!
//! `B` starts at zero so a freshly wrapped model computes exactly what the
//! base model does. Adapter vars live next to the base weight as
//! `<proj>.lora_A.weight` / `<proj>.lora_B.weight`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use super::params::ParamStore;
use crate::config::LoraConfig;

/// Marker shared by every adapter var name.
pub const LORA_MARKER: &str = ".lora_";

pub fn is_lora_param(name: &str) -> bool {
    name.contains(LORA_MARKER)
}

#[derive(Debug, Clone)]
struct Adapter {
    a: Linear,
    b: Linear,
    scaling: f64,
}

/// Bias-free linear layer with an optional adapter.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    adapter: Option<Adapter>,
    /// Var path of the base weight, used when merging.
    weight_path: String,
}

impl LoraLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        lora: Option<&LoraConfig>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_path = format!("{}.weight", vb.prefix());
        let base = candle_nn::linear_no_bias(in_dim, out_dim, vb.clone())?;
        let adapter = match lora {
            Some(cfg) => {
                let a = vb.pp("lora_A").get_with_hints(
                    (cfg.r, in_dim),
                    "weight",
                    candle_nn::init::DEFAULT_KAIMING_UNIFORM,
                )?;
                let b = vb
                    .pp("lora_B")
                    .get_with_hints((out_dim, cfg.r), "weight", Init::Const(0.0))?;
                Some(Adapter {
                    a: Linear::new(a, None),
                    b: Linear::new(b, None),
                    scaling: cfg.scaling(),
                })
            }
            None => None,
        };
        Ok(Self {
            base,
            adapter,
            weight_path,
        })
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Fold the adapter into the base weight (`W += scaling · B·A`) and drop it.
    pub fn merge(&mut self, store: &ParamStore) -> crate::Result<()> {
        let Some(adapter) = self.adapter.take() else {
            return Ok(());
        };
        let var = store.get(&self.weight_path)?.ok_or_else(|| {
            crate::Error::WeightLoad(format!("no base weight {}", self.weight_path))
        })?;
        let delta = (adapter.b.weight().matmul(adapter.a.weight())? * adapter.scaling)?;
        let merged = (var.as_tensor() + delta)?.detach();
        var.set(&merged)?;
        Ok(())
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.base.forward(xs)?;
        match &self.adapter {
            Some(adapter) => {
                let low = adapter.b.forward(&adapter.a.forward(xs)?)?;
                out + (low * adapter.scaling)?
            }
            None => Ok(out),
        }
    }
}
