// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation cache produced by a capturing forward pass.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, SEQ_AXIS, SiteLayout};

/// Every activation recorded by one forward pass, keyed by site.
///
/// Positional sites hold `[batch, seq, ...]`; attention scores and patterns
/// hold `[batch, heads, seq_q, seq_k]`. The cache is read-only once built;
/// patching reads from it and never writes back.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use candle_core::{DType, Device, Tensor};
/// use inject_mi::{ActivationCache, HookPoint};
///
/// let mut captures = HashMap::new();
/// captures.insert(
///     HookPoint::ResidPost(0),
///     Tensor::zeros((1, 7, 16), DType::F32, &Device::Cpu).unwrap(),
/// );
/// let cache = ActivationCache::new(captures);
/// assert_eq!(cache.seq_len().unwrap(), 7);
/// assert!(cache.get(&HookPoint::ResidPost(1)).is_none());
/// ```
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: HashMap<HookPoint, Tensor>,
}

impl ActivationCache {
    /// Wrap a map of captured activations.
    #[must_use]
    pub const fn new(activations: HashMap<HookPoint, Tensor>) -> Self {
        Self { activations }
    }

    /// Activation at `site`, if captured.
    #[must_use]
    pub fn get(&self, site: &HookPoint) -> Option<&Tensor> {
        self.activations.get(site)
    }

    /// Activation at `site`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `site` was not captured.
    pub fn require(&self, site: &HookPoint) -> Result<&Tensor> {
        self.activations
            .get(site)
            .ok_or_else(|| MIError::Hook(format!("`{site}` not present in activation cache")))
    }

    /// Whether `site` was captured.
    #[must_use]
    pub fn contains(&self, site: &HookPoint) -> bool {
        self.activations.contains_key(site)
    }

    /// Captured sites, sorted by kind then layer.
    #[must_use]
    pub fn sites(&self) -> Vec<HookPoint> {
        let mut sites: Vec<HookPoint> = self.activations.keys().copied().collect();
        sites.sort_unstable();
        sites
    }

    /// Number of captured sites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Sequence length of the captured run.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if no positional site was captured.
    pub fn seq_len(&self) -> Result<usize> {
        let tensor = self
            .activations
            .iter()
            .find(|(site, _)| matches!(site.layout(), SiteLayout::Positional { .. }))
            .map(|(_, t)| t)
            .ok_or_else(|| MIError::Hook("cache holds no positional activations".into()))?;
        Ok(tensor.dim(SEQ_AXIS)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample_cache() -> ActivationCache {
        let device = Device::Cpu;
        let mut captures = HashMap::new();
        let resid: Vec<f32> = (0..12_u8).map(f32::from).collect();
        captures.insert(
            HookPoint::ResidPost(1),
            Tensor::from_vec(resid, (1, 3, 4), &device).unwrap(),
        );
        captures.insert(
            HookPoint::AttnZ(0),
            Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap(),
        );
        captures.insert(
            HookPoint::AttnPattern(0),
            Tensor::zeros((1, 2, 3, 3), DType::F32, &device).unwrap(),
        );
        ActivationCache::new(captures)
    }

    #[test]
    fn lookup() {
        let cache = sample_cache();
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_empty());
        assert!(cache.contains(&HookPoint::AttnZ(0)));
        assert!(cache.get(&HookPoint::AttnZ(1)).is_none());
        assert!(matches!(
            cache.require(&HookPoint::ResidPre(0)),
            Err(MIError::Hook(_))
        ));
    }

    #[test]
    fn sites_sorted() {
        let cache = sample_cache();
        assert_eq!(
            cache.sites(),
            vec![
                HookPoint::AttnPattern(0),
                HookPoint::AttnZ(0),
                HookPoint::ResidPost(1)
            ]
        );
    }

    #[test]
    fn seq_len_ignores_pairwise_sites() {
        assert_eq!(sample_cache().seq_len().unwrap(), 3);
        assert!(ActivationCache::default().seq_len().is_err());
    }
}
