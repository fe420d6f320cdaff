// SPDX-License-Identifier: MIT OR Apache-2.0

//! Experiment runner for prompt-injection studies.
//!
//! Ties the prompt builder, engine, generation loop and reporters together.
//! Each runner returns a serializable report with a human-readable
//! [`Display`](std::fmt::Display) form.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::MIModel;
use crate::cache::ActivationCache;
use crate::download::ModelFiles;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;
use crate::interp::attention_report::{AttentionReport, analyze_attention};
use crate::interp::generation::{GenerateOptions, Generation, generate};
use crate::interp::patching::{PatchSpec, run_and_capture};
use crate::interp::prompt::{Prompt, PromptOptions, PromptPair, TokenizedPrompt};
use crate::interp::verdict::Verdict;
use crate::scenario;
use crate::tokenizer::MITokenizer;

/// Configuration for an experiment. Every field has a default, so a JSON
/// file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// `HuggingFace` model id or local directory.
    pub model: String,
    /// Run on CPU even if CUDA is available.
    pub force_cpu: bool,
    /// String whose appearance in the output counts as a leak.
    pub secret: String,
    /// Generation step budget.
    pub max_new_tokens: usize,
    /// Prepend BOS to every prompt.
    pub prepend_bos: bool,
    /// Pad token override.
    pub pad_token: Option<u32>,
    /// Wall-clock budget per generation, in seconds.
    pub deadline_secs: Option<f64>,
    /// Layer for attention analysis (default: last).
    pub attention_layer: Option<usize>,
    /// Tokens reported per head.
    pub top_k: usize,
    /// Baseline (clean) prompt text.
    pub baseline: String,
    /// Variant (injected) prompt text.
    pub variant: String,
    /// Substring of `variant` marking the injected instruction.
    pub injected_marker: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: "openai-community/gpt2".to_owned(),
            force_cpu: false,
            secret: scenario::SECRET.to_owned(),
            max_new_tokens: 50,
            prepend_bos: true,
            pad_token: None,
            deadline_secs: None,
            attention_layer: None,
            top_k: 5,
            baseline: scenario::clean_text(),
            variant: scenario::injected_text(),
            injected_marker: scenario::INSTRUCTION.to_owned(),
        }
    }
}

impl ExperimentConfig {
    /// Load a config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] if the file cannot be read and
    /// [`MIError::Config`] if it is not a valid config.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| MIError::Config(format!("invalid experiment config {}: {e}", path.display())))
    }

    /// Baseline prompt.
    #[must_use]
    pub fn baseline_prompt(&self) -> Prompt {
        Prompt::new(self.baseline.clone())
    }

    /// Variant prompt with the injected marker located.
    #[must_use]
    pub fn variant_prompt(&self) -> Prompt {
        Prompt::marking(self.variant.clone(), &self.injected_marker)
    }

    fn deadline(&self) -> Result<Option<Duration>> {
        self.deadline_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| MIError::Config(format!("invalid deadline_secs {secs}: {e}")))
            })
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One generation and its verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Generation result.
    pub generation: Generation,
    /// Leak check on the generated text.
    pub verdict: Verdict,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  prompt tokens: {}, generated: {} ({})",
            self.generation.prompt_len,
            self.generation.generated.len(),
            self.generation.stop_reason
        )?;
        writeln!(f, "  output: {:?}", self.generation.generated_text)?;
        writeln!(f, "  {}", self.verdict)
    }
}

/// Unpatched generation on both prompts.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionReport {
    /// Baseline prompt outcome.
    pub clean: RunOutcome,
    /// Variant prompt outcome.
    pub injected: RunOutcome,
}

impl fmt::Display for InjectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- clean prompt ---")?;
        write!(f, "{}", self.clean)?;
        writeln!(f, "--- injected prompt ---")?;
        write!(f, "{}", self.injected)
    }
}

/// Patched generation on the baseline, with the unpatched reference.
#[derive(Debug, Clone, Serialize)]
pub struct PatchingReport {
    /// Patches applied, in display form.
    pub patches: Vec<String>,
    /// Aligned sequence length.
    pub aligned_len: usize,
    /// Pad tokens prepended to the baseline.
    pub baseline_padding: usize,
    /// Unpatched generation on the aligned baseline.
    pub clean: RunOutcome,
    /// Patched generation on the aligned baseline.
    pub patched: RunOutcome,
}

impl fmt::Display for PatchingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "aligned length {} (baseline padding {})",
            self.aligned_len, self.baseline_padding
        )?;
        writeln!(f, "--- clean reference ---")?;
        write!(f, "{}", self.clean)?;
        writeln!(f, "--- patched: {} ---", self.patches.join(", "))?;
        write!(f, "{}", self.patched)
    }
}

/// One row of a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRow {
    /// Patch applied.
    pub patch: String,
    /// Whether the secret appeared.
    pub leaked: bool,
    /// Generated text.
    pub generated_text: String,
}

/// One patched generation per candidate patch.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Rows in candidate order.
    pub rows: Vec<SweepRow>,
}

impl SweepReport {
    /// Number of candidates that leaked.
    #[must_use]
    pub fn leak_count(&self) -> usize {
        self.rows.iter().filter(|r| r.leaked).count()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            let mark = if row.leaked { "LEAK" } else { "safe" };
            writeln!(f, "{mark:>4}  {}", row.patch)?;
        }
        writeln!(f, "{} of {} patches leaked", self.leak_count(), self.rows.len())
    }
}

/// Every head of `site`'s layer, one candidate each.
#[must_use]
pub fn head_candidates(site: HookPoint, num_heads: usize) -> Vec<PatchSpec> {
    (0..num_heads).map(|h| PatchSpec::heads(site, &[h])).collect()
}

/// One whole-site candidate per layer, built by `site_at`.
#[must_use]
pub fn layer_candidates(num_layers: usize, site_at: fn(usize) -> HookPoint) -> Vec<PatchSpec> {
    (0..num_layers).map(|l| PatchSpec::site(site_at(l))).collect()
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// A loaded model and tokenizer plus the experiment config.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    model: MIModel,
    tokenizer: MITokenizer,
}

impl Experiment {
    /// Wrap an already-loaded model and tokenizer.
    #[must_use]
    pub const fn new(model: MIModel, tokenizer: MITokenizer, config: ExperimentConfig) -> Self {
        Self {
            config,
            model,
            tokenizer,
        }
    }

    /// Resolve and load the model named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Download`], [`MIError::Config`],
    /// [`MIError::Model`] or [`MIError::Tokenization`] on load failure.
    pub fn load(config: ExperimentConfig) -> Result<Self> {
        let files = ModelFiles::resolve(&config.model)?;
        let model = MIModel::from_files(&files, config.force_cpu)?;
        let tokenizer = MITokenizer::from_file(&files.tokenizer)?;
        info!(
            model = %config.model,
            layers = model.num_layers(),
            heads = model.num_heads(),
            hidden = model.hidden_size(),
            "model loaded"
        );
        Ok(Self::new(model, tokenizer, config))
    }

    /// The loaded model.
    #[must_use]
    pub const fn model(&self) -> &MIModel {
        &self.model
    }

    /// The loaded tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &MITokenizer {
        &self.tokenizer
    }

    /// The config in use.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Greedy generation on the baseline and variant prompts, unaligned.
    ///
    /// # Errors
    ///
    /// Propagates tokenization, generation and model errors.
    pub fn run_injection_test(&self) -> Result<InjectionReport> {
        let options = self.prompt_options();
        let bos = options.resolve_bos(&self.tokenizer)?;
        let clean = TokenizedPrompt::tokenize(&self.tokenizer, &self.config.baseline_prompt(), bos)?;
        let injected =
            TokenizedPrompt::tokenize(&self.tokenizer, &self.config.variant_prompt(), bos)?;

        let empty = ActivationCache::default();
        Ok(InjectionReport {
            clean: self.outcome(&clean.ids, &[], &empty)?,
            injected: self.outcome(&injected.ids, &[], &empty)?,
        })
    }

    /// Attention from the last position of the variant prompt.
    ///
    /// # Errors
    ///
    /// Propagates tokenization and model errors; an out-of-range
    /// `attention_layer` is [`MIError::SiteNotFound`].
    pub fn run_attention_analysis(&self) -> Result<AttentionReport> {
        let options = self.prompt_options();
        let bos = options.resolve_bos(&self.tokenizer)?;
        let injected =
            TokenizedPrompt::tokenize(&self.tokenizer, &self.config.variant_prompt(), bos)?;
        analyze_attention(
            &self.model,
            &injected,
            self.config.attention_layer,
            self.config.top_k,
        )
    }

    /// Capture the variant, then generate on the aligned baseline with and
    /// without `patches`.
    ///
    /// # Errors
    ///
    /// Propagates prompt, patch validation and model errors.
    pub fn run_patching(&self, patches: &[PatchSpec]) -> Result<PatchingReport> {
        let pair = self.build_pair()?;
        let (_, variant_cache) = run_and_capture(&self.model, &pair.variant.ids)?;

        let clean = self.outcome(&pair.baseline.ids, &[], &ActivationCache::default())?;
        let patched = self.outcome(&pair.baseline.ids, patches, &variant_cache)?;
        info!(
            patches = patches.len(),
            clean_leaked = clean.verdict.leaked,
            patched_leaked = patched.verdict.leaked,
            "patching run complete"
        );

        Ok(PatchingReport {
            patches: patches.iter().map(ToString::to_string).collect(),
            aligned_len: pair.len(),
            baseline_padding: pair.baseline.padding,
            clean,
            patched,
        })
    }

    /// One patched generation per candidate, sharing one variant capture.
    ///
    /// # Errors
    ///
    /// Propagates prompt, patch validation and model errors. The first
    /// invalid candidate aborts the sweep.
    pub fn run_sweep(&self, candidates: &[PatchSpec]) -> Result<SweepReport> {
        let pair = self.build_pair()?;
        let (_, variant_cache) = run_and_capture(&self.model, &pair.variant.ids)?;

        let mut rows = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            let outcome =
                self.outcome(&pair.baseline.ids, std::slice::from_ref(candidate), &variant_cache)?;
            info!(
                candidate = i + 1,
                of = candidates.len(),
                patch = %candidate,
                leaked = outcome.verdict.leaked,
                "sweep step"
            );
            rows.push(SweepRow {
                patch: candidate.to_string(),
                leaked: outcome.verdict.leaked,
                generated_text: outcome.generation.generated_text,
            });
        }
        Ok(SweepReport { rows })
    }

    fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            prepend_bos: self.config.prepend_bos,
            pad_token: self.config.pad_token,
            ..PromptOptions::for_model(&self.model)
        }
    }

    fn build_pair(&self) -> Result<PromptPair> {
        PromptPair::build(
            &self.tokenizer,
            &self.config.baseline_prompt(),
            &self.config.variant_prompt(),
            &self.prompt_options(),
        )
    }

    fn generate_options(&self) -> Result<GenerateOptions> {
        Ok(GenerateOptions {
            max_steps: self.config.max_new_tokens,
            end_token: self.prompt_options().resolve_eos(&self.tokenizer),
            deadline: self.config.deadline()?,
        })
    }

    fn outcome(
        &self,
        seed: &[u32],
        patches: &[PatchSpec],
        source: &ActivationCache,
    ) -> Result<RunOutcome> {
        let generation = generate(
            &self.model,
            &self.tokenizer,
            seed,
            patches,
            source,
            &self.generate_options()?,
        )?;
        let verdict = Verdict::evaluate(&generation.generated_text, &self.config.secret);
        Ok(RunOutcome {
            generation,
            verdict,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"max_new_tokens": 8, "force_cpu": true}"#).unwrap();
        assert_eq!(config.max_new_tokens, 8);
        assert!(config.force_cpu);
        assert_eq!(config.secret, "Orion-17");
        assert_eq!(config.top_k, 5);
        assert!(config.prepend_bos);
        assert_eq!(config.variant, scenario::injected_text());
    }

    #[test]
    fn negative_deadline_rejected() {
        let config = ExperimentConfig {
            deadline_secs: Some(-1.0),
            ..ExperimentConfig::default()
        };
        assert!(matches!(config.deadline(), Err(MIError::Config(_))));
        assert_eq!(ExperimentConfig::default().deadline().unwrap(), None);
    }

    #[test]
    fn variant_prompt_marks_instruction() {
        let config = ExperimentConfig::default();
        assert!(config.variant_prompt().injected.is_some());
        assert!(config.baseline_prompt().injected.is_none());
    }

    #[test]
    fn candidate_builders() {
        let heads = head_candidates(HookPoint::AttnZ(11), 3);
        assert_eq!(heads.len(), 3);
        assert_eq!(heads.get(2).unwrap(), &PatchSpec::heads(HookPoint::AttnZ(11), &[2]));

        let resid = layer_candidates(2, HookPoint::ResidPost);
        assert_eq!(
            resid,
            vec![
                PatchSpec::site(HookPoint::ResidPost(0)),
                PatchSpec::site(HookPoint::ResidPost(1)),
            ]
        );
    }

    #[test]
    fn sweep_counts_leaks() {
        let report = SweepReport {
            rows: vec![
                SweepRow { patch: "a".into(), leaked: true, generated_text: String::new() },
                SweepRow { patch: "b".into(), leaked: false, generated_text: String::new() },
            ],
        };
        assert_eq!(report.leak_count(), 1);
        assert!(report.to_string().contains("1 of 2 patches leaked"));
    }
}
