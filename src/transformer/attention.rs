// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention with GQA, separate or fused QKV, and hook sites.
//!
//! Per-head sites (`hook_q`, `hook_k`, `hook_v`, `hook_z`) are exposed as
//! `[batch, seq, heads, head_dim]` so that position-prefix patching works
//! the same way as for the residual stream.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{TransformerConfig, WeightLayout};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, run_hook};

use super::load_linear;
use super::rope::RopeCache;

// ---------------------------------------------------------------------------
// QKV projection
// ---------------------------------------------------------------------------

/// QKV projection, either separate or fused.
enum QkvProj {
    /// `q_proj`, `k_proj`, `v_proj`.
    Separate {
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
    },
    /// GPT-2 `c_attn`, split via `narrow()`.
    Fused {
        qkv_proj: Linear,
        q_dim: usize,
        kv_dim: usize,
    },
}

impl QkvProj {
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `(Q, K, V)` each `[batch, seq, proj_dim]`
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        match self {
            Self::Separate {
                q_proj,
                k_proj,
                v_proj,
            } => Ok((q_proj.forward(x)?, k_proj.forward(x)?, v_proj.forward(x)?)),
            Self::Fused {
                qkv_proj,
                q_dim,
                kv_dim,
            } => {
                let qkv = qkv_proj.forward(x)?;
                let q = qkv.narrow(D::Minus1, 0, *q_dim)?;
                let k = qkv.narrow(D::Minus1, *q_dim, *kv_dim)?;
                let v = qkv.narrow(D::Minus1, q_dim + kv_dim, *kv_dim)?;
                Ok((q, k, v))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head attention layer with hook points.
pub struct Attention {
    qkv: QkvProj,
    o_proj: Linear,
    num_attention_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    /// `1/sqrt(head_dim)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_dim = config.num_attention_heads * config.head_dim;
        let kv_dim = config.num_kv_heads * config.head_dim;
        let layout = config.weight_layout;
        let bias = config.qkv_bias;

        let (qkv, o_proj) = match layout {
            WeightLayout::Gpt2 => {
                let qkv_proj =
                    load_linear(hidden, q_dim + 2 * kv_dim, bias, layout, vb.pp("c_attn"))?;
                let o_proj = load_linear(q_dim, hidden, config.o_proj_bias, layout, vb.pp("c_proj"))?;
                (
                    QkvProj::Fused {
                        qkv_proj,
                        q_dim,
                        kv_dim,
                    },
                    o_proj,
                )
            }
            WeightLayout::Llama => {
                let qkv = QkvProj::Separate {
                    q_proj: load_linear(hidden, q_dim, bias, layout, vb.pp("q_proj"))?,
                    k_proj: load_linear(hidden, kv_dim, bias, layout, vb.pp("k_proj"))?,
                    v_proj: load_linear(hidden, kv_dim, bias, layout, vb.pp("v_proj"))?,
                };
                let o_proj = load_linear(q_dim, hidden, config.o_proj_bias, layout, vb.pp("o_proj"))?;
                (qkv, o_proj)
            }
        };

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (config.head_dim as f64).sqrt();

        Ok(Self {
            qkv,
            o_proj,
            num_attention_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale,
        })
    }

    /// Run attention, applying capture and patches at each site.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - `mask`: `[1, 1, seq, seq]` causal mask
    ///
    /// `rope` is `Some` only for rotary models.
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor failures
    /// and propagates patch errors from the hook sites.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        rope: Option<&RopeCache>,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, _hidden) = x.dims3()?;

        let (q, k, v) = self.qkv.forward(x)?;

        // [batch, seq, heads, head_dim]: hookable layout
        let q = q.reshape((batch, seq_len, self.num_attention_heads, self.head_dim))?;
        let k = k.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let q = run_hook(hooks, cache, HookPoint::AttnQ(layer_idx), q)?;
        let k = run_hook(hooks, cache, HookPoint::AttnK(layer_idx), k)?;
        let v = run_hook(hooks, cache, HookPoint::AttnV(layer_idx), v)?;

        // [batch, heads, seq, head_dim] for the matmuls
        let mut q = q.transpose(1, 2)?.contiguous()?;
        let mut k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        if let Some(rope) = rope {
            q = rope.apply(&q)?;
            k = rope.apply(&k)?;
        }

        let k = repeat_kv(k, self.num_attention_heads, self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_attention_heads, self.num_kv_heads)?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? * self.scale)?.broadcast_add(mask)?;
        let scores = run_hook(hooks, cache, HookPoint::AttnScores(layer_idx), scores)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
        if original_dtype != DType::F32 {
            pattern = pattern.to_dtype(original_dtype)?;
        }
        let pattern = run_hook(hooks, cache, HookPoint::AttnPattern(layer_idx), pattern)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, heads, head_dim]
        let z = pattern.matmul(&v)?.transpose(1, 2)?.contiguous()?;
        let z = run_hook(hooks, cache, HookPoint::AttnZ(layer_idx), z)?;

        let z = z.reshape((batch, seq_len, self.num_attention_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&z)?)
    }
}

/// Expand key/value tensors from `n_kv_heads` to `n_heads` for GQA.
///
/// # Shapes
/// - `x`: `[batch, n_kv_heads, seq, head_dim]`
/// - returns: `[batch, n_heads, seq, head_dim]`
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    if n_heads == n_kv_heads {
        return Ok(x);
    }
    let repeats = n_heads / n_kv_heads;
    let (batch, _kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((batch, n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((batch, n_heads, seq_len, head_dim))?)
}
