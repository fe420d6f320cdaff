// SPDX-License-Identifier: MIT OR Apache-2.0

//! Generic decoder-only transformer with a hook site at every stage.
//!
//! One forward pass covers GPT-2, `LLaMA` and `Qwen2`, parameterized by
//! [`TransformerConfig`](crate::config::TransformerConfig). Every site
//! passes through [`run_hook`], which applies a registered patch and then
//! captures; with an empty [`HookSpec`] each hook is a no-op.

pub(crate) mod attention;
pub(crate) mod mlp;
pub(crate) mod norm;
pub(crate) mod rope;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::{MIBackend, SpecialTokens};
use crate::config::{PositionEncoding, TransformerConfig, WeightLayout};
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec, run_hook};
use crate::util::masks;

use self::attention::Attention;
use self::mlp::Mlp;
use self::norm::Norm;
use self::rope::RopeCache;

// ---------------------------------------------------------------------------
// Weight naming
// ---------------------------------------------------------------------------

/// Checkpoint tensor names for one [`WeightLayout`].
struct WeightNames {
    embed: &'static str,
    pos_embed: Option<&'static str>,
    layers: &'static str,
    attn_norm: &'static str,
    attn: &'static str,
    mlp_norm: &'static str,
    mlp: &'static str,
    final_norm: &'static str,
}

impl WeightNames {
    const fn for_layout(layout: WeightLayout) -> Self {
        match layout {
            WeightLayout::Gpt2 => Self {
                embed: "wte",
                pos_embed: Some("wpe"),
                layers: "h",
                attn_norm: "ln_1",
                attn: "attn",
                mlp_norm: "ln_2",
                mlp: "mlp",
                final_norm: "ln_f",
            },
            WeightLayout::Llama => Self {
                embed: "embed_tokens",
                pos_embed: None,
                layers: "layers",
                attn_norm: "input_layernorm",
                attn: "self_attn",
                mlp_norm: "post_attention_layernorm",
                mlp: "mlp",
                final_norm: "norm",
            },
        }
    }
}

/// Load a projection, transposing GPT-2's `Conv1D` `[in, out]` weights.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub(crate) fn load_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    layout: WeightLayout,
    vb: VarBuilder<'_>,
) -> Result<Linear> {
    match layout {
        WeightLayout::Llama if bias => Ok(candle_nn::linear(in_dim, out_dim, vb)?),
        WeightLayout::Llama => Ok(candle_nn::linear_no_bias(in_dim, out_dim, vb)?),
        WeightLayout::Gpt2 => {
            let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
            let bias = if bias {
                Some(vb.get(out_dim, "bias")?)
            } else {
                None
            };
            Ok(Linear::new(weight, bias))
        }
    }
}

// ---------------------------------------------------------------------------
// TransformerLayer
// ---------------------------------------------------------------------------

/// A single pre-norm decoder layer.
struct TransformerLayer {
    attn_norm: Norm,
    attention: Attention,
    mlp_norm: Norm,
    mlp: Mlp,
}

impl TransformerLayer {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, names: &WeightNames, vb: VarBuilder<'_>) -> Result<Self> {
        let norm = |name: &str| {
            Norm::load(config.norm_type, config.hidden_size, config.norm_eps, vb.pp(name))
        };
        Ok(Self {
            attn_norm: norm(names.attn_norm)?,
            attention: Attention::load(config, vb.pp(names.attn))?,
            mlp_norm: norm(names.mlp_norm)?,
            mlp: Mlp::load(config, vb.pp(names.mlp))?,
        })
    }
}

// ---------------------------------------------------------------------------
// GenericTransformer
// ---------------------------------------------------------------------------

/// Config-driven generic transformer backend.
pub struct GenericTransformer {
    embed_tokens: Embedding,
    /// Learned position table (GPT-2 only).
    pos_embed: Option<Embedding>,
    layers: Vec<TransformerLayer>,
    final_norm: Norm,
    /// `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    /// `None` for learned positions.
    rope_cache: Option<RopeCache>,
    config: TransformerConfig,
    dtype: DType,
}

impl GenericTransformer {
    /// Load a transformer from a [`VarBuilder`].
    ///
    /// GPT-2 checkpoints are accepted with or without the `transformer.`
    /// prefix; `LLaMA`-layout checkpoints live under `model.`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if weight loading fails or dimensions
    /// are inconsistent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(
        config: TransformerConfig,
        device: &Device,
        dtype: DType,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let names = WeightNames::for_layout(config.weight_layout);
        let vb_model = match config.weight_layout {
            WeightLayout::Gpt2 if vb.contains_tensor("transformer.wte.weight") => {
                vb.pp("transformer")
            }
            WeightLayout::Gpt2 => vb.clone(),
            WeightLayout::Llama => vb.pp("model"),
        };

        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb_model.pp(names.embed))?;
        let pos_embed = match (config.position_encoding, names.pos_embed) {
            (PositionEncoding::Learned, Some(name)) => Some(candle_nn::embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb_model.pp(name),
            )?),
            _ => None,
        };

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let vb_layer = vb_model.pp(format!("{}.{i}", names.layers));
            layers.push(TransformerLayer::load(&config, &names, vb_layer)?);
        }

        let final_norm = Norm::load(
            config.norm_type,
            config.hidden_size,
            config.norm_eps,
            vb_model.pp(names.final_norm),
        )?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rope_cache = match config.position_encoding {
            PositionEncoding::Rotary { theta } => Some(RopeCache::new(
                config.head_dim,
                config.max_position_embeddings,
                theta,
                device,
                dtype,
            )?),
            PositionEncoding::Learned => None,
        };

        tracing::info!(
            layout = %config.weight_layout,
            layers = config.num_layers,
            heads = config.num_attention_heads,
            hidden = config.hidden_size,
            "loaded transformer"
        );

        Ok(Self {
            embed_tokens,
            pos_embed,
            layers,
            final_norm,
            lm_head,
            rope_cache,
            config,
            dtype,
        })
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, vocab_size]`
    fn project_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.lm_head {
            Some(head) => Ok(head.forward(hidden)?),
            // Tied: hidden @ embed^T
            None => Ok(hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?),
        }
    }
}

// ---------------------------------------------------------------------------
// MIBackend implementation
// ---------------------------------------------------------------------------

impl MIBackend for GenericTransformer {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn num_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn max_position_embeddings(&self) -> Option<usize> {
        Some(self.config.max_position_embeddings)
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: self.config.bos_token_id,
            eos: self.config.eos_token_id,
            pad: self.config.pad_token_id,
        }
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(MIError::Config(format!(
                "sequence of {seq_len} tokens exceeds the model context ({})",
                self.config.max_position_embeddings
            )));
        }

        // Output is set at the end; captures accumulate meanwhile.
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        // --- Embedding ---
        let embed = self.embed_tokens.forward(input_ids)?;
        let mut hidden = run_hook(hooks, &mut cache, HookPoint::Embed, embed)?;

        if let Some(wpe) = &self.pos_embed {
            #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
            let positions = Tensor::arange(0_u32, seq_len as u32, device)?;
            // [1, seq, hidden]
            let pos = wpe.forward(&positions)?.unsqueeze(0)?;
            let pos = run_hook(hooks, &mut cache, HookPoint::PosEmbed, pos)?;
            hidden = hidden.broadcast_add(&pos)?;
        }

        let mask = masks::create_causal_mask(seq_len, device, self.dtype)?;

        // --- Layer loop ---
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            hidden = run_hook(hooks, &mut cache, HookPoint::ResidPre(layer_idx), hidden)?;

            let attn_out = layer.attention.forward(
                &layer.attn_norm.forward(&hidden)?,
                &mask,
                self.rope_cache.as_ref(),
                layer_idx,
                hooks,
                &mut cache,
            )?;
            let attn_out = run_hook(hooks, &mut cache, HookPoint::AttnOut(layer_idx), attn_out)?;
            hidden = (hidden + attn_out)?;
            hidden = run_hook(hooks, &mut cache, HookPoint::ResidMid(layer_idx), hidden)?;

            let mlp_out = layer.mlp.forward(
                &layer.mlp_norm.forward(&hidden)?,
                layer_idx,
                hooks,
                &mut cache,
            )?;
            let mlp_out = run_hook(hooks, &mut cache, HookPoint::MlpOut(layer_idx), mlp_out)?;
            hidden = (hidden + mlp_out)?;
            hidden = run_hook(hooks, &mut cache, HookPoint::ResidPost(layer_idx), hidden)?;
        }

        // --- Final norm + head ---
        let normed = self.final_norm.forward(&hidden)?;
        let normed = run_hook(hooks, &mut cache, HookPoint::FinalNorm, normed)?;
        cache.set_output(self.project_logits(&normed)?);

        Ok(cache)
    }
}
