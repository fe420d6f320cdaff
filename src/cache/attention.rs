// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-softmax attention patterns, indexed by layer.
//!
//! [`AttentionCache`] is a view over the `hook_pattern` entries of an
//! [`ActivationCache`](super::ActivationCache). Each stored tensor has shape
//! `[batch, heads, seq_q, seq_k]`; queries always read batch 0.

use std::collections::BTreeMap;
use std::ops::Range;

use candle_core::{DType, Tensor};

use super::ActivationCache;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;

/// Per-layer attention patterns from one forward pass.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use inject_mi::AttentionCache;
///
/// let mut cache = AttentionCache::default();
/// // shape [batch=1, heads=2, seq=4, seq=4]
/// cache.insert(0, Tensor::ones((1, 2, 4, 4), DType::F32, &Device::Cpu).unwrap());
/// let row = cache.head_row(0, 1, 3).unwrap();
/// assert_eq!(row.len(), 4);
/// ```
#[derive(Debug, Default)]
pub struct AttentionCache {
    patterns: BTreeMap<usize, Tensor>,
}

impl AttentionCache {
    /// Collect every `hook_pattern` entry of an activation cache.
    ///
    /// Tensor handles are shared, not copied.
    #[must_use]
    pub fn from_activations(cache: &ActivationCache) -> Self {
        let patterns = cache
            .sites()
            .into_iter()
            .filter_map(|site| match site {
                HookPoint::AttnPattern(layer) => {
                    cache.get(&site).map(|t| (layer, t.clone()))
                }
                _ => None,
            })
            .collect();
        Self { patterns }
    }

    /// Store the pattern for `layer`, replacing any previous one.
    ///
    /// # Shapes
    /// - `pattern`: `[batch, heads, seq_q, seq_k]`
    pub fn insert(&mut self, layer: usize, pattern: Tensor) {
        self.patterns.insert(layer, pattern);
    }

    /// Number of cached layers.
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Number of heads at `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer is not cached.
    pub fn num_heads(&self, layer: usize) -> Result<usize> {
        Ok(self.layer(layer)?.dim(1)?)
    }

    /// Weights from query `position` to every key, one row per head.
    ///
    /// # Shapes
    /// - returns: `[heads][seq_k]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer is not cached or the position
    /// is out of range.
    pub fn rows_from_position(&self, layer: usize, position: usize) -> Result<Vec<Vec<f32>>> {
        let pattern = self.layer(layer)?;
        let seq_q = pattern.dim(2)?;
        if position >= seq_q {
            return Err(MIError::Hook(format!(
                "position {position} out of range (seq_q={seq_q})"
            )));
        }
        // PROMOTE: reductions over attention weights run in F32
        // [batch, heads, seq_q, seq_k] -> [heads, seq_k]
        let rows = pattern
            .to_dtype(DType::F32)?
            .narrow(0, 0, 1)?
            .narrow(2, position, 1)?
            .squeeze(2)?
            .squeeze(0)?;
        Ok(rows.to_vec2()?)
    }

    /// Weights from query `position` to every key, for one head.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer is not cached, or the head or
    /// position is out of range.
    pub fn head_row(&self, layer: usize, head: usize, position: usize) -> Result<Vec<f32>> {
        let n_heads = self.num_heads(layer)?;
        self.rows_from_position(layer, position)?
            .into_iter()
            .nth(head)
            .ok_or_else(|| {
                MIError::Hook(format!("head {head} out of range ({n_heads} heads)"))
            })
    }

    /// Weights from query `position`, averaged across heads.
    ///
    /// # Errors
    ///
    /// Same as [`rows_from_position`](Self::rows_from_position).
    pub fn attention_from_position(&self, layer: usize, position: usize) -> Result<Vec<f32>> {
        let rows = self.rows_from_position(layer, position)?;
        let n_heads = rows.len();
        let mut mean = vec![0.0_f32; rows.first().map_or(0, Vec::len)];
        for row in &rows {
            for (acc, w) in mean.iter_mut().zip(row) {
                *acc += w;
            }
        }
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let denom = n_heads.max(1) as f32;
        mean.iter_mut().for_each(|v| *v /= denom);
        Ok(mean)
    }

    /// Top-`k` key positions for one head, highest weight first.
    ///
    /// Equal weights keep the lower position first.
    ///
    /// # Errors
    ///
    /// Same as [`head_row`](Self::head_row).
    pub fn top_attended_by_head(
        &self,
        layer: usize,
        head: usize,
        from_position: usize,
        k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        Ok(top_k(self.head_row(layer, head, from_position)?, k))
    }

    /// Top-`k` key positions averaged across heads, highest weight first.
    ///
    /// # Errors
    ///
    /// Same as [`rows_from_position`](Self::rows_from_position).
    pub fn top_attended_positions(
        &self,
        layer: usize,
        from_position: usize,
        k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        Ok(top_k(self.attention_from_position(layer, from_position)?, k))
    }

    /// Share of query `position`'s attention, summed over heads, that lands
    /// on the key positions in `span`. Returns a fraction in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer is missing, the position is out
    /// of range, or `span` extends past the key length.
    pub fn span_share(&self, layer: usize, position: usize, span: &Range<usize>) -> Result<f32> {
        let rows = self.rows_from_position(layer, position)?;
        let seq_k = rows.first().map_or(0, Vec::len);
        if span.end > seq_k || span.start > span.end {
            return Err(MIError::Hook(format!(
                "span {span:?} out of range (seq_k={seq_k})"
            )));
        }
        let mut total = 0.0_f32;
        let mut on_span = 0.0_f32;
        for row in &rows {
            total += row.iter().sum::<f32>();
            on_span += row
                .get(span.clone())
                .map_or(0.0, |slice| slice.iter().sum::<f32>());
        }
        if total <= 0.0 {
            return Ok(0.0);
        }
        Ok(on_span / total)
    }

    fn layer(&self, layer: usize) -> Result<&Tensor> {
        self.patterns
            .get(&layer)
            .ok_or_else(|| MIError::Hook(format!("layer {layer} not in attention cache")))
    }
}

/// Stable descending sort, truncated to `k`.
fn top_k(weights: Vec<f32>, k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = weights.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use candle_core::Device;

    /// `[1, 2, 4, 4]`: head 0 uniform, head 1 diagonal-heavy.
    fn sample_cache() -> AttentionCache {
        #[rustfmt::skip]
        let data: Vec<f32> = vec![
            // Head 0 (uniform)
            0.25, 0.25, 0.25, 0.25,
            0.25, 0.25, 0.25, 0.25,
            0.25, 0.25, 0.25, 0.25,
            0.25, 0.25, 0.25, 0.25,
            // Head 1 (diagonal-heavy)
            0.70, 0.10, 0.10, 0.10,
            0.10, 0.70, 0.10, 0.10,
            0.10, 0.10, 0.70, 0.10,
            0.10, 0.10, 0.10, 0.70,
        ];
        let mut cache = AttentionCache::default();
        cache.insert(0, Tensor::from_vec(data, (1, 2, 4, 4), &Device::Cpu).unwrap());
        cache
    }

    #[test]
    fn from_activations_keeps_only_patterns() {
        let device = Device::Cpu;
        let mut captures = HashMap::new();
        captures.insert(
            HookPoint::AttnPattern(3),
            Tensor::zeros((1, 2, 4, 4), DType::F32, &device).unwrap(),
        );
        captures.insert(
            HookPoint::AttnScores(3),
            Tensor::zeros((1, 2, 4, 4), DType::F32, &device).unwrap(),
        );
        captures.insert(
            HookPoint::ResidPost(3),
            Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap(),
        );
        let cache = AttentionCache::from_activations(&ActivationCache::new(captures));
        assert_eq!(cache.n_layers(), 1);
        assert_eq!(cache.num_heads(3).unwrap(), 2);
        assert!(cache.num_heads(0).is_err());
    }

    #[test]
    fn head_rows() {
        let cache = sample_cache();
        assert_eq!(cache.head_row(0, 1, 2).unwrap(), vec![0.10, 0.10, 0.70, 0.10]);
        assert!(cache.head_row(0, 2, 0).is_err());
        assert!(cache.head_row(0, 0, 4).is_err());
        assert!(cache.head_row(1, 0, 0).is_err());
    }

    #[test]
    fn attention_from_position_averages_heads() {
        let attn = sample_cache().attention_from_position(0, 0).unwrap();
        assert_eq!(attn.len(), 4);
        assert!((attn[0] - 0.475).abs() < 1e-5);
        assert!((attn[3] - 0.175).abs() < 1e-5);
    }

    #[test]
    fn top_k_ties_keep_lower_position() {
        let cache = sample_cache();
        let top = cache.top_attended_by_head(0, 0, 3, 2).unwrap();
        assert_eq!(top, vec![(0, 0.25), (1, 0.25)]);

        let top = cache.top_attended_by_head(0, 1, 3, 2).unwrap();
        assert_eq!(top.first().map(|p| p.0), Some(3));

        assert_eq!(cache.top_attended_positions(0, 0, 100).unwrap().len(), 4);
        // Query 2 averaged: [0.175, 0.175, 0.475, 0.175]
        let mean = cache.top_attended_positions(0, 2, 2).unwrap();
        assert_eq!(mean.iter().map(|p| p.0).collect::<Vec<_>>(), vec![2, 0]);
    }

    #[test]
    fn span_share_sums_over_heads() {
        let cache = sample_cache();
        // Query 3, keys 2..4: head0 = 0.5, head1 = 0.8; total mass = 2.
        let share = cache.span_share(0, 3, &(2..4)).unwrap();
        assert!((share - 0.65).abs() < 1e-5);
        assert_eq!(cache.span_share(0, 3, &(1..1)).unwrap(), 0.0);
        assert!(cache.span_share(0, 3, &(2..5)).is_err());
    }
}
