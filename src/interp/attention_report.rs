// SPDX-License-Identifier: MIT OR Apache-2.0

//! Where does the final position look?
//!
//! Captures one layer's attention pattern over a prompt and reports, per
//! head and averaged over heads, the most-attended tokens from the last
//! position, plus the share of attention that lands on the injected span when
//! one is marked.

use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::backend::MIModel;
use crate::cache::{ActivationCache, AttentionCache};
use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, HookSpec};
use crate::interp::patching::token_tensor;
use crate::interp::prompt::TokenizedPrompt;

/// One attended key position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendedToken {
    /// Key position.
    pub position: usize,
    /// Display string of the token at `position`.
    pub token: String,
    /// Attention weight.
    pub weight: f32,
}

/// Top attended tokens for one head.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadFocus {
    /// Head index.
    pub head: usize,
    /// Highest weight first.
    pub top: Vec<AttendedToken>,
}

/// Attention summary from the final query position of one layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttentionReport {
    /// Layer analysed.
    pub layer: usize,
    /// Query position (the last one).
    pub query_position: usize,
    /// Per-head focus, in head order.
    pub heads: Vec<HeadFocus>,
    /// Top positions of the head-averaged row, highest weight first.
    pub mean_top: Vec<AttendedToken>,
    /// Token range of the injected span, if marked.
    pub injected_span: Option<Range<usize>>,
    /// Percent of attention, summed over heads, on `injected_span`.
    pub injected_share_pct: Option<f32>,
}

/// Analyse attention from the last position of `prompt` at `layer`
/// (default: the final layer).
///
/// # Errors
///
/// - [`MIError::SiteNotFound`] if `layer` is out of range.
/// - [`MIError::Tokenization`] if the prompt is empty.
/// - [`MIError::Model`] on forward-pass failures.
pub fn analyze_attention(
    model: &MIModel,
    prompt: &TokenizedPrompt,
    layer: Option<usize>,
    top_k: usize,
) -> Result<AttentionReport> {
    let layer = match layer {
        Some(layer) => layer,
        None => model
            .num_layers()
            .checked_sub(1)
            .ok_or_else(|| MIError::Config("model has no layers".into()))?,
    };
    let site = HookPoint::AttnPattern(layer);
    site.validate(model.num_layers())?;

    let input = token_tensor(&prompt.ids, model.device())?;
    let mut hooks = HookSpec::new();
    hooks.capture(site);
    let (_, captures) = model.forward(&input, &hooks)?.into_parts();
    let attention = AttentionCache::from_activations(&ActivationCache::new(captures));

    let query_position = prompt.len().saturating_sub(1);
    let heads = (0..attention.num_heads(layer)?)
        .map(|head| {
            let top = attended(
                prompt,
                attention.top_attended_by_head(layer, head, query_position, top_k)?,
            );
            Ok(HeadFocus { head, top })
        })
        .collect::<Result<Vec<_>>>()?;
    let mean_top = attended(
        prompt,
        attention.top_attended_positions(layer, query_position, top_k)?,
    );

    let injected_share_pct = prompt
        .injected_tokens
        .as_ref()
        .map(|span| attention.span_share(layer, query_position, span))
        .transpose()?
        .map(|share| share * 100.0);

    tracing::info!(
        layer,
        heads = heads.len(),
        injected_share_pct = ?injected_share_pct,
        "attention analysed"
    );

    Ok(AttentionReport {
        layer,
        query_position,
        heads,
        mean_top,
        injected_span: prompt.injected_tokens.clone(),
        injected_share_pct,
    })
}

fn attended(prompt: &TokenizedPrompt, ranked: Vec<(usize, f32)>) -> Vec<AttendedToken> {
    ranked
        .into_iter()
        .map(|(position, weight)| AttendedToken {
            position,
            token: prompt.tokens.get(position).cloned().unwrap_or_default(),
            weight,
        })
        .collect()
}

impl fmt::Display for AttentionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for focus in &self.heads {
            writeln!(f, "[Layer {}, Head {}] is focusing on:", self.layer, focus.head)?;
            for t in &focus.top {
                writeln!(f, "  - Token: {:?}, Attention: {:.4}", t.token, t.weight)?;
            }
        }
        if !self.mean_top.is_empty() {
            writeln!(f, "[Layer {}, mean over heads] is focusing on:", self.layer)?;
            for t in &self.mean_top {
                writeln!(f, "  - Token: {:?}, Attention: {:.4}", t.token, t.weight)?;
            }
        }
        match (&self.injected_span, self.injected_share_pct) {
            (Some(span), Some(pct)) => writeln!(
                f,
                "Attention on injected tokens {}..{}: {pct:.2}%",
                span.start, span.end
            ),
            _ => writeln!(f, "No injected span marked."),
        }
    }
}
