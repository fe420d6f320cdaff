// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers: [`RmsNorm`](NormType::RmsNorm) for the `LLaMA`
//! family, [`LayerNorm`](NormType::LayerNorm) for GPT-2.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::NormType;
use crate::error::Result;

/// A normalization layer, selected at load time by [`NormType`].
pub enum Norm {
    /// RMS normalization.
    Rms(candle_nn::RmsNorm),
    /// Layer normalization (weight + bias).
    Layer(candle_nn::LayerNorm),
}

impl Norm {
    /// Load a norm of the given type. Both variants read `weight`; layer
    /// norm also reads `bias`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(norm_type: NormType, hidden_size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        match norm_type {
            NormType::RmsNorm => Ok(Self::Rms(candle_nn::rms_norm(hidden_size, eps, vb)?)),
            NormType::LayerNorm => {
                let config = candle_nn::LayerNormConfig {
                    eps,
                    ..Default::default()
                };
                Ok(Self::Layer(candle_nn::layer_norm(hidden_size, config, vb)?))
            }
        }
    }

    /// Apply normalization over the last dimension.
    ///
    /// # Shapes
    /// - `xs`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`](crate::MIError::Model) on tensor failures.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms(norm) => Ok(norm.forward(xs)?),
            Self::Layer(norm) => Ok(norm.forward(xs)?),
        }
    }
}
