// SPDX-License-Identifier: MIT OR Apache-2.0

//! Instrumented inference: capture every site, or run with activations
//! patched in from another run.
//!
//! ## Patch semantics
//!
//! A [`PatchSpec`] names a site and a [`HeadSelection`]. At that site the
//! destination activation (the one computed by the current forward pass)
//! has its selected slice overwritten by the source activation from an
//! [`ActivationCache`], position by position, for the first
//! `min(src_len, dest_len)` sequence positions. A longer source is
//! truncated; positions past the source length keep their natural value.
//!
//! All specs targeting one site are merged before the forward pass, so
//! each site sees exactly one overwrite.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};

use crate::backend::MIModel;
use crate::cache::ActivationCache;
use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, HookSpec, SEQ_AXIS, SiteLayout};

// ---------------------------------------------------------------------------
// HeadSelection / PatchSpec
// ---------------------------------------------------------------------------

/// Which slice of a site's non-sequence dimensions to overwrite.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadSelection {
    /// Overwrite the whole activation at each patched position.
    All,
    /// Overwrite only these heads (sorted, deduplicated).
    Heads(Vec<usize>),
}

impl HeadSelection {
    /// Select specific heads. Order and duplicates are normalised away.
    #[must_use]
    pub fn heads(heads: &[usize]) -> Self {
        let mut heads = heads.to_vec();
        heads.sort_unstable();
        heads.dedup();
        Self::Heads(heads)
    }

    /// Union of two selections.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Heads(mut a), Self::Heads(b)) => {
                a.extend(b);
                Self::heads(&a)
            }
        }
    }

    /// Whether `head` is overwritten by this selection.
    #[must_use]
    pub fn includes(&self, head: usize) -> bool {
        match self {
            Self::All => true,
            Self::Heads(heads) => heads.binary_search(&head).is_ok(),
        }
    }
}

impl fmt::Display for HeadSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Heads(heads) => {
                let list: Vec<String> = heads.iter().map(ToString::to_string).collect();
                write!(f, "heads {}", list.join(","))
            }
        }
    }
}

/// A site plus the slice of it to overwrite from the source run.
///
/// Parses from `<site>` or `<site>@<head>,<head>,...`:
///
/// ```
/// use inject_mi::{HeadSelection, HookPoint, PatchSpec};
///
/// let spec: PatchSpec = "z:11@4,0".parse().unwrap();
/// assert_eq!(spec.site, HookPoint::AttnZ(11));
/// assert_eq!(spec.selection, HeadSelection::Heads(vec![0, 4]));
///
/// let spec: PatchSpec = "blocks.11.hook_resid_post".parse().unwrap();
/// assert_eq!(spec.selection, HeadSelection::All);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    /// Site to patch.
    pub site: HookPoint,
    /// Slice of the site to overwrite.
    pub selection: HeadSelection,
}

impl PatchSpec {
    /// Patch the whole activation at `site`.
    #[must_use]
    pub const fn site(site: HookPoint) -> Self {
        Self {
            site,
            selection: HeadSelection::All,
        }
    }

    /// Patch only the given heads at `site`.
    #[must_use]
    pub fn heads(site: HookPoint, heads: &[usize]) -> Self {
        Self {
            site,
            selection: HeadSelection::heads(heads),
        }
    }
}

impl fmt::Display for PatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selection {
            HeadSelection::All => write!(f, "{}", self.site),
            selection @ HeadSelection::Heads(_) => write!(f, "{} [{selection}]", self.site),
        }
    }
}

impl FromStr for PatchSpec {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((site, heads)) = s.split_once('@') else {
            return Ok(Self::site(s.parse()?));
        };
        let site: HookPoint = site.parse()?;
        let heads = heads
            .split(',')
            .map(|h| {
                h.trim().parse::<usize>().map_err(|_| {
                    MIError::Config(format!("invalid head index `{h}` in patch spec `{s}`"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::heads(site, &heads))
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

/// Run one forward pass over `tokens`, capturing every site.
///
/// # Shapes
/// - returns: logits `[1, seq, vocab]` and a cache whose positional
///   entries are `[1, seq, ...]`
///
/// # Errors
///
/// Returns [`MIError::Tokenization`] for an empty sequence and
/// [`MIError::Model`] on forward-pass failures.
pub fn run_and_capture(model: &MIModel, tokens: &[u32]) -> Result<(Tensor, ActivationCache)> {
    let input = token_tensor(tokens, model.device())?;
    let mut hooks = HookSpec::new();
    hooks.capture_all(model.num_layers());
    let (logits, captures) = model.forward(&input, &hooks)?.into_parts();
    tracing::debug!(
        seq_len = tokens.len(),
        sites = captures.len(),
        "captured activations"
    );
    Ok((logits, ActivationCache::new(captures)))
}

/// Run one forward pass over `tokens` with `patch_specs` applied from
/// `source_cache`.
///
/// `source_cache` is only read; the overwrite builds new tensors.
///
/// # Errors
///
/// - [`MIError::SiteNotFound`] if a spec names a layer the model lacks.
/// - [`MIError::Hook`] if the source cache did not capture a site.
/// - [`MIError::ShapeMismatch`] if a selection does not fit its site.
pub fn run_with_patch(
    model: &MIModel,
    tokens: &[u32],
    patch_specs: &[PatchSpec],
    source_cache: &ActivationCache,
) -> Result<Tensor> {
    let hooks = patch_hooks(model, patch_specs, source_cache)?;
    let input = token_tensor(tokens, model.device())?;
    Ok(model.forward(&input, &hooks)?.into_output())
}

/// Resolve patch specs against a source cache into a [`HookSpec`].
///
/// Validation happens here, before any forward pass, so a bad spec fails
/// fast. The resulting hook spec can be reused for many forward passes.
///
/// # Errors
///
/// Same as [`run_with_patch`].
pub fn patch_hooks(
    model: &MIModel,
    patch_specs: &[PatchSpec],
    source_cache: &ActivationCache,
) -> Result<HookSpec> {
    let mut hooks = HookSpec::new();
    for spec in patch_specs {
        spec.site.validate(model.num_layers())?;
        let source = source_cache.require(&spec.site)?;
        check_selection(spec.site, source, &spec.selection)?;
        // Tensor clones share storage; the cache itself is untouched.
        hooks.patch(spec.site, source.clone(), spec.selection.clone());
    }
    Ok(hooks)
}

/// Overwrite the selected slice of `dest` with `source`.
///
/// # Shapes
/// - `dest`: `[batch, dest_len, ...]`
/// - `source`: `[batch, src_len, ...]`, same non-sequence dims as `dest`
/// - returns: same shape as `dest`
///
/// # Errors
///
/// Returns [`MIError::ShapeMismatch`] if the site is pairwise, the ranks or
/// feature dims differ, or the head selection does not fit the site.
pub fn overwrite(
    dest: &Tensor,
    source: &Tensor,
    site: HookPoint,
    selection: &HeadSelection,
) -> Result<Tensor> {
    check_selection(site, dest, selection)?;

    let dest_dims = dest.dims();
    let src_dims = source.dims();
    let same_features = dest_dims.len() == src_dims.len()
        && dest_dims
            .iter()
            .zip(src_dims)
            .enumerate()
            .all(|(axis, (d, s))| axis == SEQ_AXIS || d == s);
    if !same_features {
        return Err(MIError::ShapeMismatch(format!(
            "`{site}`: source shape {src_dims:?} does not match destination {dest_dims:?}"
        )));
    }

    if matches!(selection, HeadSelection::Heads(heads) if heads.is_empty()) {
        return Ok(dest.clone());
    }

    let dest_len = dest.dim(SEQ_AXIS)?;
    let patch_len = dest_len.min(source.dim(SEQ_AXIS)?);
    if patch_len == 0 {
        return Ok(dest.clone());
    }

    let mut head = source.narrow(SEQ_AXIS, 0, patch_len)?;
    if head.dtype() != dest.dtype() {
        head = head.to_dtype(dest.dtype())?;
    }
    if !head.device().same_device(dest.device()) {
        head = head.to_device(dest.device())?;
    }

    // Source rows for the leading positions, destination rows after.
    let spliced = if patch_len < dest_len {
        let tail = dest.narrow(SEQ_AXIS, patch_len, dest_len - patch_len)?;
        Tensor::cat(&[&head, &tail], SEQ_AXIS)?
    } else {
        head
    };

    match head_mask(dest, site, selection)? {
        None => Ok(spliced),
        Some(mask) => Ok(mask.where_cond(&spliced, dest)?),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build the `[1, seq]` input tensor for a token sequence.
pub(crate) fn token_tensor(tokens: &[u32], device: &Device) -> Result<Tensor> {
    if tokens.is_empty() {
        return Err(MIError::Tokenization(
            "cannot run a forward pass on an empty token sequence".into(),
        ));
    }
    Ok(Tensor::new(tokens, device)?.unsqueeze(0)?)
}

/// Check that `selection` can be applied to `tensor` at `site`.
fn check_selection(site: HookPoint, tensor: &Tensor, selection: &HeadSelection) -> Result<()> {
    let head_axis = match site.layout() {
        SiteLayout::Pairwise => {
            return Err(MIError::ShapeMismatch(format!(
                "`{site}` holds pairwise attention weights and cannot be patched"
            )));
        }
        SiteLayout::Positional { head_axis } => head_axis,
    };
    if tensor.rank() <= SEQ_AXIS {
        return Err(MIError::ShapeMismatch(format!(
            "`{site}` activation has rank {}, expected [batch, seq, ...]",
            tensor.rank()
        )));
    }

    let HeadSelection::Heads(heads) = selection else {
        return Ok(());
    };
    let axis = head_axis.ok_or_else(|| {
        MIError::ShapeMismatch(format!(
            "`{site}` has no head axis; select `all` instead of heads"
        ))
    })?;
    let n_heads = tensor.dim(axis)?;
    if let Some(bad) = heads.iter().find(|&&h| h >= n_heads) {
        return Err(MIError::ShapeMismatch(format!(
            "head {bad} out of range for `{site}` ({n_heads} heads)"
        )));
    }
    Ok(())
}

/// `u8` mask over `dest`'s shape that is 1 on selected heads, or `None`
/// when every element is selected.
fn head_mask(dest: &Tensor, site: HookPoint, selection: &HeadSelection) -> Result<Option<Tensor>> {
    let HeadSelection::Heads(heads) = selection else {
        return Ok(None);
    };
    let SiteLayout::Positional {
        head_axis: Some(axis),
    } = site.layout()
    else {
        return Err(MIError::ShapeMismatch(format!("`{site}` has no head axis")));
    };

    let n_heads = dest.dim(axis)?;
    let keep: Vec<u8> = (0..n_heads).map(|h| u8::from(heads.contains(&h))).collect();

    let mut shape = vec![1_usize; dest.rank()];
    if let Some(slot) = shape.get_mut(axis) {
        *slot = n_heads;
    }
    // CONTIGUOUS: broadcast views have zero strides; where_cond wants a dense mask
    let mask = Tensor::from_vec(keep, n_heads, dest.device())?
        .reshape(shape)?
        .broadcast_as(dest.shape())?
        .contiguous()?;
    Ok(Some(mask))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn ramp(shape: &[usize], offset: f32) -> Tensor {
        let n: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let data: Vec<f32> = (0..n).map(|i| i as f32 + offset).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn shorter_source_patches_only_leading_positions() {
        let dest = Tensor::zeros((1, 5, 2), DType::F32, &Device::Cpu).unwrap();
        let source = Tensor::ones((1, 3, 2), DType::F32, &Device::Cpu).unwrap();

        let out = overwrite(&dest, &source, HookPoint::ResidPost(0), &HeadSelection::All).unwrap();

        assert_eq!(out.dims(), &[1, 5, 2]);
        assert_eq!(
            values(&out),
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn longer_source_is_truncated() {
        let dest = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let source = ramp(&[1, 4, 2], 1.0);

        let out = overwrite(&dest, &source, HookPoint::AttnOut(3), &HeadSelection::All).unwrap();

        assert_eq!(values(&out), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn head_selection_touches_only_selected_heads() {
        // [batch=1, seq=2, heads=3, head_dim=2]
        let dest = Tensor::zeros((1, 2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let source = Tensor::ones((1, 2, 3, 2), DType::F32, &Device::Cpu).unwrap();

        let out = overwrite(
            &dest,
            &source,
            HookPoint::AttnZ(0),
            &HeadSelection::heads(&[1]),
        )
        .unwrap();

        #[rustfmt::skip]
        let expected = vec![
            0.0, 0.0,  1.0, 1.0,  0.0, 0.0,
            0.0, 0.0,  1.0, 1.0,  0.0, 0.0,
        ];
        assert_eq!(values(&out), expected);
    }

    #[test]
    fn head_selection_with_truncation() {
        let dest = Tensor::zeros((1, 3, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let source = Tensor::ones((1, 1, 2, 1), DType::F32, &Device::Cpu).unwrap();

        let out = overwrite(
            &dest,
            &source,
            HookPoint::AttnZ(0),
            &HeadSelection::heads(&[0]),
        )
        .unwrap();

        assert_eq!(values(&out), vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn source_is_not_mutated() {
        let dest = Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let source = ramp(&[1, 3, 2], 10.0);
        let before = values(&source);

        let _ = overwrite(&dest, &source, HookPoint::ResidMid(0), &HeadSelection::All).unwrap();

        assert_eq!(values(&source), before);
        assert_eq!(values(&dest), vec![0.0; 8]);
    }

    #[test]
    fn empty_head_list_is_a_no_op() {
        let dest = Tensor::zeros((1, 2, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let source = Tensor::ones((1, 2, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let out = overwrite(
            &dest,
            &source,
            HookPoint::AttnZ(0),
            &HeadSelection::Heads(Vec::new()),
        )
        .unwrap();
        assert_eq!(values(&out), vec![0.0; 4]);
    }

    #[test]
    fn shape_errors() {
        let resid = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let z = Tensor::zeros((1, 2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let pattern = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();

        // Head selection on a site without heads.
        let err = overwrite(&resid, &resid, HookPoint::ResidPost(0), &HeadSelection::heads(&[0]))
            .unwrap_err();
        assert!(matches!(err, MIError::ShapeMismatch(_)));

        // Head index out of range.
        let err =
            overwrite(&z, &z, HookPoint::AttnZ(0), &HeadSelection::heads(&[3])).unwrap_err();
        assert!(matches!(err, MIError::ShapeMismatch(_)));

        // Pairwise site.
        let err = overwrite(&pattern, &pattern, HookPoint::AttnPattern(0), &HeadSelection::All)
            .unwrap_err();
        assert!(matches!(err, MIError::ShapeMismatch(_)));

        // Feature dims differ.
        let narrow = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = overwrite(&resid, &narrow, HookPoint::ResidPost(0), &HeadSelection::All)
            .unwrap_err();
        assert!(matches!(err, MIError::ShapeMismatch(_)));
    }

    #[test]
    fn selection_union() {
        let a = HeadSelection::heads(&[4, 0]);
        let b = HeadSelection::heads(&[2, 4]);
        assert_eq!(a.clone().union(b), HeadSelection::Heads(vec![0, 2, 4]));
        assert_eq!(a.union(HeadSelection::All), HeadSelection::All);
        assert!(HeadSelection::heads(&[1, 6]).includes(6));
        assert!(!HeadSelection::heads(&[1, 6]).includes(2));
    }

    #[test]
    fn patch_spec_parse_and_display() {
        let spec: PatchSpec = "z:11@0,1,2,4,6,7".parse().unwrap();
        assert_eq!(spec.site, HookPoint::AttnZ(11));
        assert_eq!(spec.selection, HeadSelection::Heads(vec![0, 1, 2, 4, 6, 7]));
        assert_eq!(spec.to_string(), "blocks.11.attn.hook_z [heads 0,1,2,4,6,7]");

        assert!("z:11@x".parse::<PatchSpec>().is_err());
        assert!("nope:1".parse::<PatchSpec>().is_err());
    }

    #[test]
    fn empty_tokens_rejected() {
        let err = token_tensor(&[], &Device::Cpu).unwrap_err();
        assert!(matches!(err, MIError::Tokenization(_)));
    }
}
