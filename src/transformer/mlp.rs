// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feed-forward block with `mlp.hook_pre` / `mlp.hook_post` sites.
//!
//! - Plain (GPT-2): `proj(act(fc(x)))`
//! - Gated (`LLaMA`, `Qwen2`): `down(act(gate(x)) * up(x))`
//!
//! `hook_pre` is the pre-activation (`fc(x)`, or `gate(x)` when gated) and
//! `hook_post` the input to the down projection.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::{Activation, TransformerConfig, WeightLayout};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, run_hook};

use super::load_linear;

/// MLP layer, parameterized by gating and activation.
pub struct Mlp {
    variant: MlpVariant,
    activation: Activation,
}

enum MlpVariant {
    Gated {
        gate_proj: Linear,
        up_proj: Linear,
        down_proj: Linear,
    },
    Plain {
        fc: Linear,
        proj: Linear,
    },
}

impl Mlp {
    /// Load MLP weights.
    ///
    /// Weight names: `gate_proj` / `up_proj` / `down_proj` when gated,
    /// `c_fc` / `c_proj` for GPT-2.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let bias = config.mlp_bias;
        let layout = config.weight_layout;

        let variant = if config.gated_mlp {
            MlpVariant::Gated {
                gate_proj: load_linear(hidden, inter, bias, layout, vb.pp("gate_proj"))?,
                up_proj: load_linear(hidden, inter, bias, layout, vb.pp("up_proj"))?,
                down_proj: load_linear(inter, hidden, bias, layout, vb.pp("down_proj"))?,
            }
        } else {
            let (fc_name, proj_name) = match layout {
                WeightLayout::Gpt2 => ("c_fc", "c_proj"),
                WeightLayout::Llama => ("up_proj", "down_proj"),
            };
            MlpVariant::Plain {
                fc: load_linear(hidden, inter, bias, layout, vb.pp(fc_name))?,
                proj: load_linear(inter, hidden, bias, layout, vb.pp(proj_name))?,
            }
        };

        Ok(Self {
            variant,
            activation: config.activation,
        })
    }

    /// Run the MLP forward pass.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor failures
    /// and propagates patch errors from the hook sites.
    pub fn forward(
        &self,
        x: &Tensor,
        layer_idx: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        match &self.variant {
            MlpVariant::Gated {
                gate_proj,
                up_proj,
                down_proj,
            } => {
                let pre = run_hook(hooks, cache, HookPoint::MlpPre(layer_idx), gate_proj.forward(x)?)?;
                let gated = (apply_activation(&pre, self.activation)? * up_proj.forward(x)?)?;
                let post = run_hook(hooks, cache, HookPoint::MlpPost(layer_idx), gated)?;
                Ok(down_proj.forward(&post)?)
            }
            MlpVariant::Plain { fc, proj } => {
                let pre = run_hook(hooks, cache, HookPoint::MlpPre(layer_idx), fc.forward(x)?)?;
                let act = apply_activation(&pre, self.activation)?;
                let post = run_hook(hooks, cache, HookPoint::MlpPost(layer_idx), act)?;
                Ok(proj.forward(&post)?)
            }
        }
    }
}

fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Silu => Ok(candle_nn::ops::silu(x)?),
        Activation::Gelu => Ok(x.gelu_erf()?),
        Activation::GeluApprox => Ok(x.gelu()?),
    }
}
