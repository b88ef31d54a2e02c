//! Grouped residual finite scalar quantization (FSQ).
//!
//! Maps continuous audio latents to the discrete ids the GPT predicts:
//!
//! ```text
//! latent [B, T, dim] ─ split into G groups ─┬─ project_in → FSQ ×R (residual) → project_out
//!                                           └─ ... per group
//! ids [B, T, G·R]   (group-major: g0r0, g0r1, g1r0, ...)
//! ```
//!
//! Each FSQ stage bounds every code dimension with `tanh`, rounds to one of
//! `levels[i]` values and normalizes to [-1, 1]. Rounding uses a
//! straight-through estimator so gradients reach the encoder. Var names follow
//! `vector_quantize_pytorch` (`rvqs.{g}.project_in`, `rvqs.{g}.project_out`).

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::VqConfig;

/// Single FSQ stage. Holds only per-dimension constants, no parameters.
#[derive(Debug, Clone)]
struct Fsq {
    half_l: Tensor,
    offset: Tensor,
    shift: Tensor,
    half_width: Tensor,
    basis: Tensor,
}

impl Fsq {
    fn new(levels: &[usize], device: &Device) -> Result<Self> {
        const EPS: f64 = 1e-3;
        let n = levels.len();
        let half_l: Vec<f64> = levels
            .iter()
            .map(|&l| (l as f64 - 1.0) * (1.0 + EPS) / 2.0)
            .collect();
        let offset: Vec<f64> = levels
            .iter()
            .map(|&l| if l % 2 == 0 { 0.5 } else { 0.0 })
            .collect();
        let shift: Vec<f64> = offset
            .iter()
            .zip(&half_l)
            .map(|(o, h)| (o / h).atanh())
            .collect();
        let half_width: Vec<f64> = levels.iter().map(|&l| (l / 2) as f64).collect();
        let basis: Vec<f64> = levels
            .iter()
            .scan(1usize, |acc, &l| {
                let b = *acc;
                *acc *= l;
                Some(b as f64)
            })
            .collect();

        let vec = |v: Vec<f64>| -> Result<Tensor> {
            Tensor::from_vec(v.into_iter().map(|x| x as f32).collect::<Vec<_>>(), n, device)
        };
        Ok(Self {
            half_l: vec(half_l)?,
            offset: vec(offset)?,
            shift: vec(shift)?,
            half_width: vec(half_width)?,
            basis: vec(basis)?,
        })
    }

    fn bound(&self, z: &Tensor) -> Result<Tensor> {
        z.broadcast_add(&self.shift)?
            .tanh()?
            .broadcast_mul(&self.half_l)?
            .broadcast_sub(&self.offset)
    }

    /// Returns normalized codes (same shape as `z`) and flat ids `[..]` (U32).
    fn quantize(&self, z: &Tensor) -> Result<(Tensor, Tensor)> {
        let bounded = self.bound(z)?;
        let rounded = (&bounded + (bounded.round()? - &bounded)?.detach())?;
        let codes = rounded.broadcast_div(&self.half_width)?;

        let ids = codes
            .detach()
            .broadcast_mul(&self.half_width)?
            .broadcast_add(&self.half_width)?
            .broadcast_mul(&self.basis)?
            .sum(D::Minus1)?
            .round()?
            .to_dtype(DType::U32)?;
        Ok((codes, ids))
    }
}

/// Residual FSQ over one group.
#[derive(Debug, Clone)]
pub struct ResidualFsq {
    project_in: Linear,
    project_out: Linear,
    fsq: Fsq,
    /// `(levels - 1)^-q` for quantizer `q`.
    scales: Vec<Tensor>,
}

impl ResidualFsq {
    pub fn new(dim: usize, levels: &[usize], num_quantizers: usize, vb: VarBuilder) -> Result<Self> {
        let codebook_dim = levels.len();
        let device = vb.device().clone();
        let scales = (0..num_quantizers)
            .map(|q| {
                let s: Vec<f32> = levels
                    .iter()
                    .map(|&l| (l as f32 - 1.0).powi(-(q as i32)))
                    .collect();
                Tensor::from_vec(s, codebook_dim, &device)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            project_in: candle_nn::linear(dim, codebook_dim, vb.pp("project_in"))?,
            project_out: candle_nn::linear(codebook_dim, dim, vb.pp("project_out"))?,
            fsq: Fsq::new(levels, &device)?,
            scales,
        })
    }

    /// `x`: `[B, T, dim]` → (`[B, T, dim]`, ids `[B, T, R]`).
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut residual = self.project_in.forward(x)?;
        let mut quantized_out: Option<Tensor> = None;
        let mut ids = Vec::with_capacity(self.scales.len());

        for scale in &self.scales {
            let (codes, idx) = self.fsq.quantize(&residual.broadcast_div(scale)?)?;
            let quantized = codes.broadcast_mul(scale)?;
            residual = (residual - quantized.detach())?;
            quantized_out = Some(match quantized_out {
                Some(acc) => (acc + quantized)?,
                None => quantized,
            });
            ids.push(idx);
        }

        let quantized_out = match quantized_out {
            Some(q) => q,
            None => candle_core::bail!("residual FSQ needs at least one quantizer"),
        };
        let out = self.project_out.forward(&quantized_out)?;
        Ok((out, Tensor::stack(&ids, D::Minus1)?))
    }
}

/// Grouped residual FSQ (`GFSQ.quantizer`).
#[derive(Debug, Clone)]
pub struct GroupedResidualFsq {
    rvqs: Vec<ResidualFsq>,
    group_dim: usize,
}

impl GroupedResidualFsq {
    pub fn new(cfg: &VqConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.dim % cfg.groups != 0 {
            candle_core::bail!("vq dim {} not divisible into {} groups", cfg.dim, cfg.groups);
        }
        let group_dim = cfg.dim / cfg.groups;
        let rvqs = (0..cfg.groups)
            .map(|g| {
                ResidualFsq::new(
                    group_dim,
                    &cfg.levels,
                    cfg.num_quantizers,
                    vb.pp(format!("rvqs.{g}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rvqs, group_dim })
    }

    /// Quantize latents `[B, T, dim]`.
    ///
    /// Returns the quantized features `[B, T, dim]` and ids `[B, T, G·R]` (U32).
    pub fn quantize(&self, latents: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut feats = Vec::with_capacity(self.rvqs.len());
        let mut ids = Vec::with_capacity(self.rvqs.len());
        for (g, rvq) in self.rvqs.iter().enumerate() {
            let chunk = latents.narrow(D::Minus1, g * self.group_dim, self.group_dim)?;
            let (feat, idx) = rvq.forward(&chunk)?;
            feats.push(feat);
            ids.push(idx);
        }
        Ok((Tensor::cat(&feats, D::Minus1)?, Tensor::cat(&ids, D::Minus1)?))
    }
}
