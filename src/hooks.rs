// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and patching.
//!
//! Provides [`HookPoint`] (typed locations in a forward pass),
//! [`HookSpec`] (what to capture and where to patch), and
//! [`HookCache`] (captured tensors from a forward pass).
//!
//! Every positional site holds a tensor shaped `[batch, seq, ...]`, so a
//! patch can always address "the first `n` positions" along axis
//! [`SEQ_AXIS`]. Attention scores and patterns are pairwise
//! (`[batch, heads, seq_q, seq_k]`) and can be captured but not patched.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{MIError, Result};
use crate::interp::patching::{self, HeadSelection};

/// Sequence axis shared by every positional site.
pub const SEQ_AXIS: usize = 1;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or overwritten.
///
/// Structured replacement for string-keyed hook names: the layer index is
/// a field, not a substring. [`Display`](std::fmt::Display) and
/// [`FromStr`] still speak the `TransformerLens` naming convention so
/// sites can be given on the command line.
///
/// ```
/// use inject_mi::HookPoint;
///
/// let hook = HookPoint::AttnZ(11);
/// assert_eq!(hook.to_string(), "blocks.11.attn.hook_z");
///
/// let parsed: HookPoint = "z:11".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    /// Token embedding (`hook_embed`).
    Embed,
    /// Learned position embedding (`hook_pos_embed`); absent on `RoPE` models.
    PosEmbed,
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Query vectors, `[batch, seq, heads, head_dim]` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Key vectors, `[batch, seq, kv_heads, head_dim]` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Value vectors, `[batch, seq, kv_heads, head_dim]` (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax attention scores (`blocks.{i}.attn.hook_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Per-head attention output before the output projection,
    /// `[batch, seq, heads, head_dim]` (`blocks.{i}.attn.hook_z`).
    AttnZ(usize),
    /// Attention block output (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP pre-activation, `[batch, seq, d_mlp]` (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation, `[batch, seq, d_mlp]` (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP block output (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After the final norm (`hook_final_norm`).
    FinalNorm,
}

/// How a site's tensor is laid out, as far as patching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteLayout {
    /// `[batch, seq, ...]`, optionally with a head axis.
    Positional {
        /// Axis indexing attention heads, if the site has one.
        head_axis: Option<usize>,
    },
    /// `[batch, heads, seq_q, seq_k]`: capture only.
    Pairwise,
}

impl HookPoint {
    /// Layer index for per-layer sites, `None` for global ones.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::Embed | Self::PosEmbed | Self::FinalNorm => None,
            Self::ResidPre(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnZ(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
        }
    }

    /// Tensor layout at this site.
    #[must_use]
    pub const fn layout(&self) -> SiteLayout {
        match self {
            Self::AttnScores(_) | Self::AttnPattern(_) => SiteLayout::Pairwise,
            Self::AttnQ(_) | Self::AttnK(_) | Self::AttnV(_) | Self::AttnZ(_) => {
                SiteLayout::Positional { head_axis: Some(2) }
            }
            _ => SiteLayout::Positional { head_axis: None },
        }
    }

    /// Check that this site exists in a model with `n_layers` layers.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::SiteNotFound`] if the layer index is out of range.
    pub fn validate(&self, n_layers: usize) -> Result<()> {
        match self.layer() {
            Some(layer) if layer >= n_layers => Err(MIError::SiteNotFound(format!(
                "`{self}` refers to layer {layer}, model has {n_layers} layers"
            ))),
            _ => Ok(()),
        }
    }

    /// Every site a model with `n_layers` layers can expose, in forward order.
    #[must_use]
    pub fn all(n_layers: usize) -> Vec<Self> {
        let mut sites = Vec::with_capacity(n_layers * 13 + 3);
        sites.push(Self::Embed);
        sites.push(Self::PosEmbed);
        for i in 0..n_layers {
            sites.extend([
                Self::ResidPre(i),
                Self::AttnQ(i),
                Self::AttnK(i),
                Self::AttnV(i),
                Self::AttnScores(i),
                Self::AttnPattern(i),
                Self::AttnZ(i),
                Self::AttnOut(i),
                Self::ResidMid(i),
                Self::MlpPre(i),
                Self::MlpPost(i),
                Self::MlpOut(i),
                Self::ResidPost(i),
            ]);
        }
        sites.push(Self::FinalNorm);
        sites
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnZ(i) => write!(f, "blocks.{i}.attn.hook_z"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
        }
    }
}

/// Parse a site name.
///
/// Accepts the full `TransformerLens` form (`blocks.11.attn.hook_z`) and
/// the short `kind:layer` form used by `get_act_name` (`z:11`,
/// `resid_post:11`, `pattern:3`). Global sites are `embed`, `pos_embed`
/// and `final_norm` (with or without the `hook_` prefix).
impl FromStr for HookPoint {
    type Err = MIError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.strip_prefix("hook_").unwrap_or(s) {
            "embed" => return Ok(Self::Embed),
            "pos_embed" => return Ok(Self::PosEmbed),
            "final_norm" | "ln_final" => return Ok(Self::FinalNorm),
            _ => {}
        }

        let (kind, layer_str) = if let Some(rest) = s.strip_prefix("blocks.") {
            let (layer_str, suffix) = rest
                .split_once('.')
                .ok_or_else(|| MIError::SiteNotFound(format!("malformed site name `{s}`")))?;
            (suffix, layer_str)
        } else if let Some((kind, layer_str)) = s.split_once(':') {
            (kind, layer_str)
        } else {
            return Err(MIError::SiteNotFound(format!("unknown site `{s}`")));
        };

        let layer = layer_str
            .parse::<usize>()
            .map_err(|_| MIError::SiteNotFound(format!("invalid layer index in `{s}`")))?;

        site_kind(kind, layer).ok_or_else(|| MIError::SiteNotFound(format!("unknown site `{s}`")))
    }
}

/// Map a site kind (long suffix or short alias) to a [`HookPoint`].
fn site_kind(kind: &str, layer: usize) -> Option<HookPoint> {
    let point = match kind {
        "hook_resid_pre" | "resid_pre" => HookPoint::ResidPre(layer),
        "attn.hook_q" | "q" => HookPoint::AttnQ(layer),
        "attn.hook_k" | "k" => HookPoint::AttnK(layer),
        "attn.hook_v" | "v" => HookPoint::AttnV(layer),
        "attn.hook_scores" | "attn_scores" | "scores" => HookPoint::AttnScores(layer),
        "attn.hook_pattern" | "pattern" => HookPoint::AttnPattern(layer),
        "attn.hook_z" | "z" => HookPoint::AttnZ(layer),
        "hook_attn_out" | "attn_out" => HookPoint::AttnOut(layer),
        "hook_resid_mid" | "resid_mid" => HookPoint::ResidMid(layer),
        "mlp.hook_pre" | "mlp_pre" | "pre" => HookPoint::MlpPre(layer),
        "mlp.hook_post" | "mlp_post" | "post" => HookPoint::MlpPost(layer),
        "hook_mlp_out" | "mlp_out" => HookPoint::MlpOut(layer),
        "hook_resid_post" | "resid_post" => HookPoint::ResidPost(layer),
        _ => return None,
    };
    Some(point)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// A resolved patch for one site: the source activation and which heads
/// of it to copy.
#[derive(Debug, Clone)]
pub struct SitePatch {
    /// Source activation, `[batch, seq_src, ...]`.
    pub source: Tensor,
    /// Heads to overwrite (or all of them).
    pub selection: HeadSelection,
}

/// Declares which activations to capture and which sites to patch.
///
/// Passed to [`MIBackend::forward`](crate::MIBackend::forward). When empty,
/// the forward pass does no extra work.
///
/// Patches registered for the same site are merged into a single
/// [`SitePatch`], so the backend performs one combined overwrite per site.
///
/// ```
/// use inject_mi::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnPattern(11))
///      .capture(HookPoint::ResidPost(11));
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// One merged patch per site.
    patches: HashMap<HookPoint, SitePatch>,
}

impl HookSpec {
    /// Create an empty hook specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture(&mut self, hook: HookPoint) -> &mut Self {
        self.captures.insert(hook);
        self
    }

    /// Request capture of every site of a model with `n_layers` layers.
    pub fn capture_all(&mut self, n_layers: usize) -> &mut Self {
        self.captures.extend(HookPoint::all(n_layers));
        self
    }

    /// Register a patch at `hook`.
    ///
    /// If the site already has a patch, the head selections are unioned and
    /// the first registered source is kept.
    pub fn patch(&mut self, hook: HookPoint, source: Tensor, selection: HeadSelection) -> &mut Self {
        match self.patches.remove(&hook) {
            Some(existing) => {
                self.patches.insert(
                    hook,
                    SitePatch {
                        source: existing.source,
                        selection: existing.selection.union(selection),
                    },
                );
            }
            None => {
                self.patches.insert(hook, SitePatch { source, selection });
            }
        }
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// The merged patch registered at `hook`, if any.
    #[must_use]
    pub fn patch_at(&self, hook: &HookPoint) -> Option<&SitePatch> {
        self.patches.get(hook)
    }

    /// Whether this spec neither captures nor patches anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.patches.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of patched sites.
    #[must_use]
    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }
}

/// Apply the hook spec at one site: patch first, then capture.
///
/// Captures therefore record the activation that actually flowed
/// downstream.
///
/// # Errors
///
/// Returns [`MIError::ShapeMismatch`] if the registered patch does not fit
/// the activation, or [`MIError::Model`] on tensor failures.
pub(crate) fn run_hook(
    hooks: &HookSpec,
    cache: &mut HookCache,
    hook: HookPoint,
    tensor: Tensor,
) -> Result<Tensor> {
    if hooks.is_empty() {
        return Ok(tensor);
    }
    let tensor = match hooks.patch_at(&hook) {
        Some(patch) => patching::overwrite(&tensor, &patch.source, hook, &patch.selection)?,
        None => tensor,
    };
    if hooks.is_captured(&hook) {
        cache.store(hook, tensor.clone());
    }
    Ok(tensor)
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// Returned by [`MIBackend::forward`](crate::MIBackend::forward).
///
/// ```
/// use inject_mi::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 50), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
/// let resid = Tensor::zeros((1, 10, 16), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(0), resid);
///
/// assert!(cache.get(&HookPoint::ResidPost(0)).is_some());
/// assert!(cache.require(&HookPoint::Embed).is_err());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Consume the cache and return the output and the captures.
    #[must_use]
    pub fn into_parts(self) -> (Tensor, HashMap<HookPoint, Tensor>) {
        (self.output, self.captures)
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| MIError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
