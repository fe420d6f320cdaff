// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings (`RoPE`) for the `LLaMA` family.

use candle_core::{D, DType, Device, Tensor};

use crate::error::{MIError, Result};

/// Pre-computed cosine and sine tables, `[max_position, head_dim / 2]`.
pub struct RopeCache {
    cos: Tensor,
    sin: Tensor,
}

impl RopeCache {
    /// Build the tables for positions `0..max_position`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor failures.
    pub fn new(
        head_dim: usize,
        max_position: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let half_dim = head_dim / 2;

        // theta^(-2i/d), computed in f64 then narrowed once
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::as_conversions
        )]
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
        let positions = Tensor::arange(0_u32, max_position as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_position, 1))?;

        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate a query or key tensor (half-split convention).
    ///
    /// # Shapes
    /// - `x`: `[batch, n_heads, seq_len, head_dim]`
    /// - returns: same shape
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if `seq_len` exceeds the table, and
    /// [`MIError::Model`] on tensor failures.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let max_position = self.cos.dim(0)?;
        if seq_len > max_position {
            return Err(MIError::Config(format!(
                "sequence length {seq_len} exceeds the rotary table ({max_position} positions)"
            )));
        }
        let half_dim = head_dim / 2;

        // [1, 1, seq_len, half_dim]
        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // [x1*cos - x2*sin, x1*sin + x2*cos]
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let rope = RopeCache::new(4, 8, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::new(&[1.0_f32, 2.0, 3.0, 4.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 4))
            .unwrap();
        let out = rope.apply(&x).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for (got, want) in values.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn too_long_sequence_errors() {
        let rope = RopeCache::new(4, 2, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::zeros((1, 1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(rope.apply(&x), Err(MIError::Config(_))));
    }
}
