// SPDX-License-Identifier: MIT OR Apache-2.0

//! Additive attention masks.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Causal mask: `0` on and below the diagonal, `-inf` above it.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`, broadcast over batch and heads
///
/// # Errors
///
/// Returns [`MIError::Model`](crate::MIError::Model) on tensor failures.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask_data: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask_data, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}
