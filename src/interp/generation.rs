// SPDX-License-Identifier: MIT OR Apache-2.0

//! Greedy autoregressive decoding, optionally under a patch.
//!
//! Every step re-runs the full sequence (there is no KV cache), so a patch
//! keyed on positions applies at every step exactly as it would in a single
//! forward pass. Stopping is checked in a fixed order: step budget, context
//! window, deadline, then the end token just produced.

use std::fmt;
use std::time::{Duration, Instant};

use candle_core::{DType, IndexOp, Tensor};
use serde::Serialize;

use crate::backend::MIModel;
use crate::cache::ActivationCache;
use crate::error::{MIError, Result};
use crate::interp::patching::{PatchSpec, patch_hooks, token_tensor};
use crate::tokenizer::MITokenizer;

/// Limits for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Maximum number of new tokens.
    pub max_steps: usize,
    /// Token that ends generation when produced. It is kept in the output.
    pub end_token: Option<u32>,
    /// Wall-clock budget, checked before each step.
    pub deadline: Option<Duration>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_steps: 50,
            end_token: None,
            deadline: None,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The end token was produced.
    EndToken,
    /// `max_steps` tokens were produced.
    MaxSteps,
    /// The sequence reached the model's context window.
    ContextFull,
    /// The deadline elapsed.
    Deadline,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EndToken => "end token",
            Self::MaxSteps => "max steps",
            Self::ContextFull => "context full",
            Self::Deadline => "deadline",
        })
    }
}

/// Output of [`generate`].
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    /// Seed tokens followed by generated tokens.
    pub tokens: Vec<u32>,
    /// Number of seed tokens.
    pub prompt_len: usize,
    /// Generated tokens only.
    pub generated: Vec<u32>,
    /// Decoded generated tokens, special tokens included.
    pub generated_text: String,
    /// Why the loop ended.
    pub stop_reason: StopReason,
}

/// Greedily extend `seed_tokens`, applying `patch_specs` from
/// `source_cache` on every forward pass.
///
/// Pass an empty `patch_specs` (and any cache, e.g.
/// `ActivationCache::default()`) for an unpatched run.
///
/// # Errors
///
/// - [`MIError::Tokenization`] for an empty seed or a decode failure.
/// - Any error of [`patch_hooks`](crate::patch_hooks), raised before the
///   first step.
/// - [`MIError::Model`] on forward-pass failures.
pub fn generate(
    model: &MIModel,
    tokenizer: &MITokenizer,
    seed_tokens: &[u32],
    patch_specs: &[PatchSpec],
    source_cache: &ActivationCache,
    options: &GenerateOptions,
) -> Result<Generation> {
    if seed_tokens.is_empty() {
        return Err(MIError::Tokenization(
            "cannot generate from an empty seed".into(),
        ));
    }
    let hooks = patch_hooks(model, patch_specs, source_cache)?;
    let context = model.max_position_embeddings();
    let started = Instant::now();

    let mut tokens = seed_tokens.to_vec();
    let mut generated = Vec::with_capacity(options.max_steps);

    let stop_reason = loop {
        if generated.len() >= options.max_steps {
            break StopReason::MaxSteps;
        }
        if context.is_some_and(|limit| tokens.len() >= limit) {
            break StopReason::ContextFull;
        }
        if options.deadline.is_some_and(|d| started.elapsed() >= d) {
            break StopReason::Deadline;
        }

        let input = token_tensor(&tokens, model.device())?;
        let logits = model.forward(&input, &hooks)?.into_output();
        let next = argmax_last(&logits)?;
        tokens.push(next);
        generated.push(next);
        tracing::debug!(step = generated.len(), token = next, "generated");

        if options.end_token == Some(next) {
            break StopReason::EndToken;
        }
    };

    let generated_text = tokenizer.decode(&generated)?;
    tracing::info!(
        steps = generated.len(),
        patched = !patch_specs.is_empty(),
        %stop_reason,
        elapsed_ms = started.elapsed().as_millis(),
        "generation finished"
    );

    Ok(Generation {
        tokens,
        prompt_len: seed_tokens.len(),
        generated,
        generated_text,
        stop_reason,
    })
}

/// Greedy choice at the final position of `[1, seq, vocab]` logits.
fn argmax_last(logits: &Tensor) -> Result<u32> {
    let seq_len = logits.dim(1)?;
    let last = seq_len
        .checked_sub(1)
        .ok_or_else(|| MIError::ShapeMismatch("logits have no positions".into()))?;
    let row: Vec<f32> = logits.i((0, last))?.to_dtype(DType::F32)?.to_vec1()?;
    let idx = argmax(&row)
        .ok_or_else(|| MIError::ShapeMismatch("logits have an empty vocabulary".into()))?;
    u32::try_from(idx).map_err(|_| MIError::Config(format!("token index {idx} exceeds u32")))
}

/// Index of the largest value; ties go to the lowest index.
///
/// ```
/// use inject_mi::interp::generation::argmax;
///
/// assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), Some(1));
/// assert_eq!(argmax(&[]), None);
/// ```
#[must_use]
pub fn argmax(values: &[f32]) -> Option<usize> {
    let (first, rest) = values.split_first()?;
    let (best, _) = rest
        .iter()
        .enumerate()
        .fold((0, *first), |(best, best_val), (i, &v)| {
            if v > best_val { (i + 1, v) } else { (best, best_val) }
        });
    Some(best)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn argmax_prefers_lowest_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), Some(1));
        assert_eq!(argmax(&[5.0, 5.0, 5.0]), Some(0));
        assert_eq!(argmax(&[-1.0, -0.5, -2.0]), Some(1));
        assert_eq!(argmax(&[0.0]), Some(0));
    }

    #[test]
    fn argmax_ignores_nan() {
        // NaN never compares greater
        assert_eq!(argmax(&[0.5, f32::NAN, 0.4]), Some(0));
    }

    #[test]
    fn argmax_last_reads_final_position() {
        let logits = Tensor::new(
            &[[[9.0_f32, 0.0, 0.0], [0.0, 0.0, 2.0]]],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(argmax_last(&logits).unwrap(), 2);
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&StopReason::ContextFull).unwrap();
        assert_eq!(json, "\"context_full\"");
        assert_eq!(StopReason::EndToken.to_string(), "end token");
    }
}
