//! ConvNeXt codec stage (`DVAE`).
//!
//! Two instances exist in a ChatTTS checkpoint:
//! - `decoder`: GPT hidden states `[B, 768, T]` → mel `[B, 100, 2T]`
//! - `dvae`: quantized audio features `[B, 1024, T]` → mel, carrying the
//!   grouped FSQ quantizer as `vq_layer`
//!
//! ```text
//! x [B, C, T] ─ fold ─► [B, C/2, 2T] ─ conv_in ─ ConvNeXt ×N ─ conv_out ─ out_conv ─ × coef ─► mel
//! ```
//!
//! The depthwise convolution is written as a sum of shifted taps so the whole
//! stack stays differentiable with plain tensor ops.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder};

use super::quantizer::GroupedResidualFsq;
use crate::config::{DecoderConfig, VqConfig};

/// `[B, C, T]` → `[B, C/2, 2T]`: the two channel halves become interleaved frames.
pub fn fold_frames(x: &Tensor) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    if c % 2 != 0 {
        candle_core::bail!("cannot fold {c} channels into frame pairs");
    }
    x.reshape((b, 2, c / 2, t))?
        .permute((0, 2, 3, 1))?
        .reshape((b, c / 2, t * 2))
}

/// Inverse of [`fold_frames`]: `[B, C, 2T]` → `[B, 2C, T]`.
pub fn unfold_frames(x: &Tensor) -> Result<Tensor> {
    let (b, c, t2) = x.dims3()?;
    if t2 % 2 != 0 {
        candle_core::bail!("cannot unfold an odd frame count {t2}");
    }
    x.reshape((b, c, t2 / 2, 2))?
        .permute((0, 3, 1, 2))?
        .reshape((b, 2 * c, t2 / 2))
}

#[derive(Debug, Clone)]
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
            eps,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Per-channel dilated convolution with "same" padding.
#[derive(Debug, Clone)]
struct DepthwiseConv1d {
    /// `[C, 1, K]`
    weight: Tensor,
    bias: Tensor,
    kernel: usize,
    dilation: usize,
}

impl DepthwiseConv1d {
    fn new(channels: usize, kernel: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (kernel as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Ok(Self {
            weight: vb.get_with_hints((channels, 1, kernel), "weight", init)?,
            bias: vb.get_with_hints(channels, "bias", init)?,
            kernel,
            dilation,
        })
    }
}

impl Module for DepthwiseConv1d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, c, t) = x.dims3()?;
        let pad = self.dilation * (self.kernel / 2);
        let padded = x.pad_with_zeros(D::Minus1, pad, pad)?;
        let mut out = self.bias.reshape((1, c, 1))?.broadcast_as(x.shape())?.contiguous()?;
        for k in 0..self.kernel {
            let tap = self.weight.narrow(2, k, 1)?.reshape((1, c, 1))?;
            let shifted = padded.narrow(D::Minus1, k * self.dilation, t)?;
            out = (out + shifted.broadcast_mul(&tap)?)?;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct ConvNeXtBlock {
    dwconv: DepthwiseConv1d,
    norm: LayerNorm,
    pwconv1: Linear,
    pwconv2: Linear,
    gamma: Tensor,
}

impl ConvNeXtBlock {
    fn new(dim: usize, kernel: usize, dilation: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dwconv: DepthwiseConv1d::new(dim, kernel, dilation, vb.pp("dwconv"))?,
            norm: LayerNorm::new(dim, 1e-6, vb.pp("norm"))?,
            pwconv1: candle_nn::linear(dim, dim * 4, vb.pp("pwconv1"))?,
            pwconv2: candle_nn::linear(dim * 4, dim, vb.pp("pwconv2"))?,
            gamma: vb.get_with_hints(dim, "gamma", Init::Const(1e-6))?,
        })
    }
}

impl Module for ConvNeXtBlock {
    /// `[B, C, T]` → `[B, C, T]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.dwconv.forward(x)?.transpose(1, 2)?;
        let y = self.norm.forward(&y)?;
        let y = self.pwconv1.forward(&y)?.gelu_erf()?;
        let y = self.pwconv2.forward(&y)?.broadcast_mul(&self.gamma)?;
        x + y.transpose(1, 2)?
    }
}

/// Shape of one ConvNeXt stack.
#[derive(Debug, Clone, Copy)]
pub struct StackDims {
    pub idim: usize,
    pub odim: usize,
    pub hidden: usize,
    pub n_layer: usize,
    pub bn_dim: usize,
    pub kernel: usize,
    pub dilation: usize,
}

/// `conv_in` (k3 → GELU → k3), ConvNeXt blocks, 1×1 `conv_out`.
#[derive(Debug, Clone)]
pub struct ConvNeXtStack {
    conv_in_0: Conv1d,
    conv_in_2: Conv1d,
    blocks: Vec<ConvNeXtBlock>,
    conv_out: Conv1d,
}

impl ConvNeXtStack {
    pub fn new(dims: StackDims, vb: VarBuilder) -> Result<Self> {
        let same = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = vb.pp("conv_in");
        let blocks = (0..dims.n_layer)
            .map(|i| {
                ConvNeXtBlock::new(
                    dims.hidden,
                    dims.kernel,
                    dims.dilation,
                    vb.pp(format!("decoder_block.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conv_in_0: candle_nn::conv1d(dims.idim, dims.bn_dim, 3, same, conv_in.pp("0"))?,
            conv_in_2: candle_nn::conv1d(dims.bn_dim, dims.hidden, 3, same, conv_in.pp("2"))?,
            blocks,
            conv_out: candle_nn::conv1d_no_bias(
                dims.hidden,
                dims.odim,
                1,
                Default::default(),
                vb.pp("conv_out"),
            )?,
        })
    }
}

impl Module for ConvNeXtStack {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut y = self.conv_in_0.forward(x)?.gelu_erf()?;
        y = self.conv_in_2.forward(&y)?;
        for block in &self.blocks {
            y = block.forward(&y)?;
        }
        self.conv_out.forward(&y)
    }
}

/// Codec decoder with optional quantizer.
#[derive(Debug, Clone)]
pub struct Dvae {
    decoder: ConvNeXtStack,
    out_conv: Conv1d,
    /// `[1, n_mels, 1]`
    coef: Tensor,
    vq_layer: Option<GroupedResidualFsq>,
    input_dim: usize,
}

impl Dvae {
    pub fn new(cfg: &DecoderConfig, vq: Option<&VqConfig>, vb: VarBuilder) -> Result<Self> {
        let dims = StackDims {
            idim: cfg.idim,
            odim: cfg.odim,
            hidden: cfg.hidden,
            n_layer: cfg.n_layer,
            bn_dim: cfg.bn_dim,
            kernel: cfg.kernel,
            dilation: cfg.dilation,
        };
        let vq_layer = match vq {
            Some(vq) => Some(GroupedResidualFsq::new(vq, vb.pp("vq_layer").pp("quantizer"))?),
            None => None,
        };
        Ok(Self {
            decoder: ConvNeXtStack::new(dims, vb.pp("decoder"))?,
            out_conv: candle_nn::conv1d_no_bias(
                cfg.odim,
                cfg.n_mels,
                3,
                Conv1dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("out_conv"),
            )?,
            coef: vb.get_with_hints(
                (1, cfg.n_mels, 1),
                "coef",
                Init::Uniform { lo: 0.0, up: 1.0 },
            )?,
            vq_layer,
            input_dim: cfg.input_dim(),
        })
    }

    /// Width of the latent `forward` expects.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn quantizer(&self) -> Option<&GroupedResidualFsq> {
        self.vq_layer.as_ref()
    }

    /// Whether a var of this codec may be optimized. The quantizer and the
    /// output coefficients are fixed.
    pub fn is_trainable_param(name: &str) -> bool {
        !name.starts_with("vq_layer.") && name != "coef"
    }
}

impl Module for Dvae {
    /// `[B, input_dim, T]` → mel `[B, n_mels, 2T]`
    fn forward(&self, latent: &Tensor) -> Result<Tensor> {
        let x = fold_frames(latent)?;
        let y = self.decoder.forward(&x)?;
        self.out_conv.forward(&y)?.broadcast_mul(&self.coef)
    }
}
