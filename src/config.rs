// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transformer configuration and `HuggingFace` `config.json` parsing.
//!
//! [`TransformerConfig`] captures the axes that distinguish the supported
//! decoder-only families: GPT-2 (learned positions, `LayerNorm`, fused
//! `Conv1D` QKV), and `LLaMA` / `Qwen2` (`RoPE`, `RmsNorm`, GQA, gated MLP).
//!
//! # Usage
//!
//! ```
//! use inject_mi::TransformerConfig;
//!
//! let config_str = r#"{"model_type": "gpt2", "n_embd": 768, "n_layer": 12,
//!     "n_head": 12, "n_positions": 1024, "vocab_size": 50257}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = TransformerConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 12);
//! assert_eq!(config.intermediate_size, 3072);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// Layer normalization variant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// RMS normalization: `x * weight / sqrt(mean(x^2) + eps)`.
    RmsNorm,
    /// Layer normalization (weight + bias).
    LayerNorm,
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RmsNorm => write!(f, "RmsNorm"),
            Self::LayerNorm => write!(f, "LayerNorm"),
        }
    }
}

/// Activation function used in the MLP.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Sigmoid Linear Unit (used in `SwiGLU` gating).
    Silu,
    /// Gaussian Error Linear Unit, exact (erf) variant.
    Gelu,
    /// Gaussian Error Linear Unit, tanh approximation.
    ///
    /// GPT-2's `gelu_new`.
    GeluApprox,
}

impl Activation {
    /// Map a `HuggingFace` activation name.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] for names this crate does not implement.
    pub fn from_hf_name(name: &str) -> Result<Self> {
        match name {
            "silu" | "swish" => Ok(Self::Silu),
            "gelu" => Ok(Self::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Self::GeluApprox),
            other => Err(MIError::Config(format!(
                "unsupported activation function: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silu => write!(f, "SiLU"),
            Self::Gelu => write!(f, "GELU"),
            Self::GeluApprox => write!(f, "GELU (tanh approx)"),
        }
    }
}

/// How token positions are encoded.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionEncoding {
    /// Rotary embeddings applied to Q and K.
    Rotary {
        /// Base frequency.
        theta: f64,
    },
    /// A learned position embedding table added to the token embedding.
    Learned,
}

/// Checkpoint naming and tensor layout convention.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `model.layers.{i}.self_attn.q_proj`, `nn.Linear` weights `[out, in]`.
    Llama,
    /// `h.{i}.attn.c_attn`, `Conv1D` weights stored as `[in, out]`.
    Gpt2,
}

impl fmt::Display for WeightLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llama => write!(f, "llama"),
            Self::Gpt2 => write!(f, "gpt2"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransformerConfig
// ---------------------------------------------------------------------------

/// Configuration for a generic decoder-only transformer.
///
/// # Supported model families
///
/// | Family | Key config traits |
/// |--------|------------------|
/// | GPT-2 | Learned positions, `LayerNorm`, fused `Conv1D` QKV, plain GELU MLP, tied head |
/// | `LLaMA` 1/2/3 | `RoPE`, GQA, `SiLU` gated MLP, `RmsNorm` |
/// | `Qwen` 2/2.5 | `LLaMA` + QKV bias, conditional tied embeddings |
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    // --- Dimensions ----------------------------------------------------------
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of transformer layers (decoder blocks).
    pub num_layers: usize,
    /// Number of query attention heads.
    pub num_attention_heads: usize,
    /// Number of key/value heads (GQA when < `num_attention_heads`).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// MLP intermediate dimension.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length the model accepts.
    pub max_position_embeddings: usize,

    // --- Architecture axes ---------------------------------------------------
    /// Checkpoint naming convention.
    pub weight_layout: WeightLayout,
    /// Normalization variant.
    pub norm_type: NormType,
    /// Epsilon for normalization layers.
    pub norm_eps: f64,
    /// MLP activation function.
    pub activation: Activation,
    /// Whether the MLP is gated (`down(act(gate(x)) * up(x))`).
    pub gated_mlp: bool,
    /// Whether Q, K, V projections have bias terms.
    pub qkv_bias: bool,
    /// Whether the attention output projection has a bias term.
    pub o_proj_bias: bool,
    /// Whether MLP projections have bias terms.
    pub mlp_bias: bool,
    /// Whether the LM head shares weights with the token embedding.
    pub tie_word_embeddings: bool,
    /// Position encoding scheme.
    pub position_encoding: PositionEncoding,

    // --- Special tokens ------------------------------------------------------
    /// Beginning-of-sequence token id.
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token id.
    pub eos_token_id: Option<u32>,
    /// Padding token id.
    pub pad_token_id: Option<u32>,
}

// ---------------------------------------------------------------------------
// Config parsing
// ---------------------------------------------------------------------------

impl TransformerConfig {
    /// Parse a [`TransformerConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// Dispatches on the `model_type` field to a family-specific parser.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if `model_type` is missing, unsupported,
    /// or if required fields are absent.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| MIError::Config("missing 'model_type' field".into()))?;

        let parsed = match model_type {
            "gpt2" => Self::parse_gpt2(config),
            "llama" => Self::parse_llama(config),
            "qwen2" => Self::parse_qwen2(config),
            other => Err(MIError::Config(format!(
                "unsupported model_type: '{other}'"
            ))),
        }?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// GPT-2 (`GPT2LMHeadModel`).
    ///
    /// `n_inner: null` means `4 * n_embd`. The head is always tied.
    fn parse_gpt2(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "n_embd")?;
        let num_attention_heads = get_usize(config, "n_head")?;
        let activation = config
            .get("activation_function")
            .and_then(Value::as_str)
            .map_or(Ok(Activation::GeluApprox), Activation::from_hf_name)?;

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "n_layer")?,
            num_attention_heads,
            num_kv_heads: num_attention_heads,
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize_or(config, "n_inner", 4 * hidden_size),
            vocab_size: get_usize(config, "vocab_size")?,
            max_position_embeddings: get_usize_or(config, "n_positions", 1024),

            weight_layout: WeightLayout::Gpt2,
            norm_type: NormType::LayerNorm,
            norm_eps: get_f64_or(config, "layer_norm_epsilon", 1e-5),
            activation,
            gated_mlp: false,
            qkv_bias: true,
            o_proj_bias: true,
            mlp_bias: true,
            tie_word_embeddings: true,
            position_encoding: PositionEncoding::Learned,

            bos_token_id: get_optional_u32(config, "bos_token_id"),
            eos_token_id: get_optional_u32(config, "eos_token_id"),
            pad_token_id: get_optional_u32(config, "pad_token_id"),
        })
    }

    /// `LLaMA` family (`LLaMA` 1/2/3, Code-`LLaMA`).
    fn parse_llama(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "hidden_size")?;
        let num_attention_heads = get_usize(config, "num_attention_heads")?;

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_attention_heads),
            head_dim: get_head_dim(config, hidden_size, num_attention_heads)?,
            intermediate_size: get_usize(config, "intermediate_size")?,
            vocab_size: get_usize(config, "vocab_size")?,
            max_position_embeddings: get_usize_or(config, "max_position_embeddings", 4096),

            weight_layout: WeightLayout::Llama,
            norm_type: NormType::RmsNorm,
            norm_eps: get_f64_or(config, "rms_norm_eps", 1e-5),
            activation: Activation::Silu,
            gated_mlp: true,
            qkv_bias: get_bool_or(config, "attention_bias", false),
            o_proj_bias: get_bool_or(config, "attention_bias", false),
            mlp_bias: get_bool_or(config, "mlp_bias", false),
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", false),
            position_encoding: PositionEncoding::Rotary {
                theta: get_f64_or(config, "rope_theta", 10_000.0),
            },

            bos_token_id: get_optional_u32(config, "bos_token_id"),
            eos_token_id: get_optional_u32(config, "eos_token_id"),
            pad_token_id: get_optional_u32(config, "pad_token_id"),
        })
    }

    /// `Qwen2` / `Qwen2.5`: `LLaMA` with QKV bias and tied embeddings on
    /// the small checkpoints.
    fn parse_qwen2(config: &Value) -> Result<Self> {
        let mut parsed = Self::parse_llama(config)?;
        parsed.qkv_bias = get_bool_or(config, "attention_bias", true);
        parsed.o_proj_bias = false;
        parsed.norm_eps = get_f64_or(config, "rms_norm_eps", 1e-6);
        parsed.max_position_embeddings = get_usize_or(config, "max_position_embeddings", 32_768);
        parsed.position_encoding = PositionEncoding::Rotary {
            theta: get_f64_or(config, "rope_theta", 1_000_000.0),
        };
        Ok(parsed)
    }

    /// Reject dimension combinations the forward pass cannot run.
    fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.hidden_size == 0 || self.vocab_size == 0 {
            return Err(MIError::Config(
                "num_layers, hidden_size and vocab_size must be non-zero".into(),
            ));
        }
        if self.num_kv_heads == 0 || self.num_attention_heads % self.num_kv_heads != 0 {
            return Err(MIError::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_attention_heads, self.num_kv_heads
            )));
        }
        if matches!(self.position_encoding, PositionEncoding::Rotary { .. })
            && self.head_dim % 2 != 0
        {
            return Err(MIError::Config(format!(
                "rotary embeddings need an even head_dim, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| MIError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| MIError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent or null.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an optional token id. Lists (multiple EOS ids) yield the first.
fn get_optional_u32(config: &Value, key: &str) -> Option<u32> {
    let value = config.get(key)?;
    let id = value
        .as_u64()
        .or_else(|| value.as_array()?.first()?.as_u64())?;
    u32::try_from(id).ok()
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Extract `head_dim`, falling back to `hidden_size / num_attention_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_attention_heads: usize) -> Result<usize> {
    let explicit = config.get("head_dim").and_then(Value::as_u64).map(|hd| {
        usize::try_from(hd).map_err(|_| MIError::Config("head_dim overflows usize".into()))
    });

    match explicit {
        Some(result) => result,
        None if num_attention_heads == 0 => Err(MIError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        )),
        None if hidden_size % num_attention_heads != 0 => Err(MIError::Config(format!(
            "hidden_size {hidden_size} is not divisible by {num_attention_heads} heads"
        ))),
        None => Ok(hidden_size / num_attention_heads),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// `openai-community/gpt2` config.json, trimmed to the fields read.
    fn gpt2_config_json() -> Value {
        serde_json::json!({
            "model_type": "gpt2",
            "activation_function": "gelu_new",
            "bos_token_id": 50256,
            "eos_token_id": 50256,
            "layer_norm_epsilon": 1e-05,
            "n_embd": 768,
            "n_head": 12,
            "n_inner": null,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        })
    }

    #[test]
    fn parse_gpt2_small() {
        let config = TransformerConfig::from_hf_config(&gpt2_config_json()).unwrap();
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_layers, 12);
        assert_eq!(config.num_attention_heads, 12);
        assert_eq!(config.num_kv_heads, 12);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.intermediate_size, 3072);
        assert_eq!(config.max_position_embeddings, 1024);
        assert_eq!(config.weight_layout, WeightLayout::Gpt2);
        assert_eq!(config.norm_type, NormType::LayerNorm);
        assert_eq!(config.activation, Activation::GeluApprox);
        assert_eq!(config.position_encoding, PositionEncoding::Learned);
        assert!(!config.gated_mlp);
        assert!(config.qkv_bias && config.o_proj_bias && config.mlp_bias);
        assert!(config.tie_word_embeddings);
        assert_eq!(config.bos_token_id, Some(50256));
        assert_eq!(config.eos_token_id, Some(50256));
        assert_eq!(config.pad_token_id, None);
    }

    #[test]
    fn parse_llama_basic() {
        let json = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 2048,
            "num_hidden_layers": 16,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "intermediate_size": 8192,
            "vocab_size": 128256,
            "rope_theta": 500000.0,
            "max_position_embeddings": 131072,
            "eos_token_id": [128001, 128008]
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.num_kv_heads, 8);
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.weight_layout, WeightLayout::Llama);
        assert_eq!(config.norm_type, NormType::RmsNorm);
        assert!(config.gated_mlp);
        assert!(!config.qkv_bias);
        assert!(!config.tie_word_embeddings);
        assert_eq!(
            config.position_encoding,
            PositionEncoding::Rotary { theta: 500_000.0 }
        );
        assert_eq!(config.eos_token_id, Some(128_001));
    }

    #[test]
    fn parse_qwen2_bias() {
        let json = serde_json::json!({
            "model_type": "qwen2",
            "hidden_size": 896,
            "num_hidden_layers": 24,
            "num_attention_heads": 14,
            "num_key_value_heads": 2,
            "intermediate_size": 4864,
            "vocab_size": 151936,
            "tie_word_embeddings": true
        });
        let config = TransformerConfig::from_hf_config(&json).unwrap();
        assert!(config.qkv_bias);
        assert!(!config.o_proj_bias);
        assert!(config.tie_word_embeddings);
        assert_eq!(config.max_position_embeddings, 32_768);
    }

    #[test]
    fn invalid_head_grouping_errors() {
        let json = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 64,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 3,
            "intermediate_size": 128,
            "vocab_size": 100
        });
        assert!(matches!(
            TransformerConfig::from_hf_config(&json),
            Err(MIError::Config(_))
        ));
    }

    #[test]
    fn unsupported_activation_errors() {
        let mut json = gpt2_config_json();
        json["activation_function"] = serde_json::json!("relu6");
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn unsupported_model_type_errors() {
        let json = serde_json::json!({ "model_type": "bert" });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }

    #[test]
    fn missing_model_type_errors() {
        let json = serde_json::json!({ "hidden_size": 768 });
        assert!(TransformerConfig::from_hf_config(&json).is_err());
    }
}
