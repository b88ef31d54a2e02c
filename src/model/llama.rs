//! LLaMA decoder stack driven by input embeddings.
//!
//! The ChatTTS token predictor never embeds ids through the backbone: the
//! wrapper builds mixed text/audio embeddings and feeds them here together
//! with a key-padding mask. Layout and var names follow `transformers`'
//! `LlamaModel` so pretrained weights load without renaming:
//!
//! ```text
//! layers.{i}.input_layernorm ─ self_attn.{q,k,v,o}_proj ─ +residual
//!           .post_attention_layernorm ─ mlp.{gate,up,down}_proj ─ +residual
//! norm
//! ```
//!
//! Every op here is differentiable (no fused kernels), since the stack is
//! trained in place.

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::lora::LoraLinear;
use crate::config::{GptConfig, LoraConfig};

// ---------------------------------------------------------------------------
// RMSNorm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        normed.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

// ---------------------------------------------------------------------------
// Rotary embedding
// ---------------------------------------------------------------------------

/// Cos/sin tables for positions `0..max_positions`, each `[max_positions, head_dim]`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_positions: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Tables for the first `seq_len` positions.
    pub fn narrow(&self, seq_len: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.cos.narrow(0, 0, seq_len)?, self.sin.narrow(0, 0, seq_len)?))
    }

    /// Rotate `x` of shape `[B, H, S, D]` (`rotate_half` convention).
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half = x.dim(D::Minus1)? / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

fn mask_min(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Additive attention bias `[B, 1, S, S]` combining causality with key padding.
///
/// `attention_mask` is `[B, S]` (1 = valid, 0 = padding). Masked entries get
/// the dtype minimum rather than `-inf`, so a row with no visible key stays
/// finite after softmax.
pub fn causal_padding_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    let device = attention_mask.device();

    let causal: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| u8::from(j <= i)))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, seq_len, seq_len), device)?;
    let keys = attention_mask
        .to_dtype(DType::U8)?
        .reshape((batch, 1, 1, seq_len))?;
    let visible = causal.broadcast_mul(&keys)?;

    let zeros = Tensor::zeros((batch, 1, seq_len, seq_len), dtype, device)?;
    let blocked = Tensor::full(mask_min(dtype), (batch, 1, seq_len, seq_len), device)?
        .to_dtype(dtype)?;
    visible.where_cond(&zeros, &blocked)
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Projection that may carry a low-rank adapter when its name is targeted.
fn projection(
    in_dim: usize,
    out_dim: usize,
    name: &str,
    lora: Option<&LoraConfig>,
    vb: &VarBuilder,
) -> Result<LoraLinear> {
    let lora = lora.filter(|cfg| cfg.targets(name));
    LoraLinear::new(in_dim, out_dim, lora, vb.pp(name))
}

#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(cfg: &GptConfig, lora: Option<&LoraConfig>, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let q_dim = cfg.num_attention_heads * head_dim;
        let kv_dim = cfg.num_key_value_heads * head_dim;
        Ok(Self {
            q_proj: projection(cfg.hidden_size, q_dim, "q_proj", lora, &vb)?,
            k_proj: projection(cfg.hidden_size, kv_dim, "k_proj", lora, &vb)?,
            v_proj: projection(cfg.hidden_size, kv_dim, "v_proj", lora, &vb)?,
            o_proj: projection(q_dim, cfg.hidden_size, "o_proj", lora, &vb)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
        })
    }

    /// - `x`: `[B, S, hidden]`
    /// - `bias`: `[B, 1, S, S]` additive mask
    /// - `cos`, `sin`: `[S, head_dim]`
    pub fn forward(&self, x: &Tensor, bias: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let heads = |t: Tensor, n: usize| -> Result<Tensor> {
            t.reshape((batch, seq_len, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.q_proj.forward(x)?, self.num_heads)?;
        let k = heads(self.k_proj.forward(x)?, self.num_kv_heads)?;
        let v = heads(self.v_proj.forward(x)?, self.num_kv_heads)?;

        let q = RotaryEmbedding::apply(&q, cos, sin)?;
        let k = RotaryEmbedding::apply(&k, cos, sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }

    fn merge_lora(&mut self, store: &super::params::ParamStore) -> crate::Result<()> {
        for proj in [
            &mut self.q_proj,
            &mut self.k_proj,
            &mut self.v_proj,
            &mut self.o_proj,
        ] {
            proj.merge(store)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MLP + layer
// ---------------------------------------------------------------------------

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        self.down_proj.forward(&(gate * self.up_proj.forward(x)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    pub fn new(cfg: &GptConfig, lora: Option<&LoraConfig>, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, lora, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(&self, x: &Tensor, bias: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let h = self.input_layernorm.forward(x)?;
        let h = (x + self.self_attn.forward(&h, bias, cos, sin)?)?;
        let out = self.mlp.forward(&self.post_attention_layernorm.forward(&h)?)?;
        h + out
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Llama {
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    max_positions: usize,
}

impl Llama {
    pub fn new(cfg: &GptConfig, lora: Option<&LoraConfig>, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::new(cfg, lora, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let rotary = RotaryEmbedding::new(
            cfg.head_dim(),
            cfg.max_position_embeddings,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;
        Ok(Self {
            layers,
            norm,
            rotary,
            max_positions: cfg.max_position_embeddings,
        })
    }

    /// - `inputs_embeds`: `[B, S, hidden]`
    /// - `attention_mask`: `[B, S]` (1 = valid)
    ///
    /// Returns the final-norm hidden states `[B, S, hidden]`.
    pub fn forward(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _) = inputs_embeds.dims3()?;
        if seq_len > self.max_positions {
            candle_core::bail!(
                "sequence of {seq_len} positions exceeds max_position_embeddings {}",
                self.max_positions
            );
        }
        let bias = causal_padding_bias(attention_mask, inputs_embeds.dtype())?;
        let (cos, sin) = self.rotary.narrow(seq_len)?;

        let mut x = inputs_embeds.clone();
        for layer in &self.layers {
            x = layer.forward(&x, &bias, &cos, &sin)?;
        }
        self.norm.forward(&x)
    }

    pub fn merge_lora(&mut self, store: &super::params::ParamStore) -> crate::Result<()> {
        for layer in &mut self.layers {
            layer.self_attn.merge_lora(store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::ParamStore;

    #[test]
    fn bias_is_causal_and_masks_padding() {
        let mask = Tensor::new(&[[1u8, 1, 0, 1]], &Device::Cpu).unwrap();
        let bias = causal_padding_bias(&mask, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 4, 4]);
        let rows: Vec<Vec<f32>> = bias.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1] < -1e30, "future key must be blocked");
        assert!(rows[3][2] < -1e30, "padded key must be blocked");
        assert_eq!(rows[3][3], 0.0);
        assert_eq!(rows[3][1], 0.0);
    }

    #[test]
    fn rope_preserves_norm() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 32, 10_000.0, DType::F32, &device).unwrap();
        let (cos, sin) = rope.narrow(12).unwrap();
        assert_eq!(cos.dims(), &[12, 8]);
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 12, 8), &device).unwrap();
        let y = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();
        let nx: f32 = x.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        let ny: f32 = y.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!((nx - ny).abs() / nx < 1e-4);
    }

    #[test]
    fn forward_shape_and_causality() {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let cfg = GptConfig::tiny();
        let model = Llama::new(&cfg, None, store.var_builder().pp("gpt")).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 6, 16), &device).unwrap();
        let mask = Tensor::ones((1, 6), DType::U8, &device).unwrap();
        let full = model.forward(&x, &mask).unwrap();
        assert_eq!(full.dims(), &[1, 6, 16]);

        // Changing the last input must not affect earlier positions.
        let tail = Tensor::randn(0.0f32, 1.0, (1, 1, 16), &device).unwrap();
        let x2 = Tensor::cat(&[&x.narrow(1, 0, 5).unwrap(), &tail], 1).unwrap();
        let out2 = model.forward(&x2, &mask).unwrap();
        let diff: f32 = (full.narrow(1, 0, 5).unwrap() - out2.narrow(1, 0, 5).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn lora_targets_q_and_v_only() {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let lora = LoraConfig::default();
        Llama::new(&GptConfig::tiny(), Some(&lora), store.var_builder().pp("gpt")).unwrap();
        let adapters: Vec<String> = store
            .names()
            .unwrap()
            .into_iter()
            .filter(|n| crate::model::lora::is_lora_param(n))
            .collect();
        // 2 layers x (q, v) x (A, B)
        assert_eq!(adapters.len(), 8);
        assert!(adapters.iter().all(|n| n.contains("q_proj") || n.contains("v_proj")));
    }
}
