// SPDX-License-Identifier: MIT OR Apache-2.0

//! # inject-mi
//!
//! Activation patching for prompt-injection studies, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A clean prompt and an injected prompt (the same text plus an instruction
//! to reveal a secret) are aligned token by token. The injected run's
//! activations are captured at `TransformerLens`-style hook points, then
//! spliced into the clean run during greedy generation. If the secret shows
//! up, the patched sites carry the injection's effect.
//!
//! ```no_run
//! use inject_mi::{
//!     ActivationCache, GenerateOptions, HookPoint, MIModel, MITokenizer, PatchSpec, PromptOptions,
//!     PromptPair, Verdict, generate, run_and_capture, scenario,
//! };
//! use inject_mi::download::ModelFiles;
//!
//! # fn main() -> inject_mi::Result<()> {
//! let files = ModelFiles::resolve("openai-community/gpt2")?;
//! let model = MIModel::from_files(&files, true)?;
//! let tokenizer = MITokenizer::from_file(&files.tokenizer)?;
//!
//! let pair = PromptPair::build(
//!     &tokenizer,
//!     &scenario::clean_prompt(),
//!     &scenario::injected_prompt(),
//!     &PromptOptions::for_model(&model),
//! )?;
//! let (_, injected) = run_and_capture(&model, &pair.variant.ids)?;
//!
//! let patch = [PatchSpec::heads(HookPoint::AttnZ(11), &[4])];
//! let options = GenerateOptions { end_token: tokenizer.eos_token_id(), ..GenerateOptions::default() };
//! let out = generate(&model, &tokenizer, &pair.baseline.ids, &patch, &injected, &options)?;
//! println!("{}", Verdict::evaluate(&out.generated_text, scenario::SECRET));
//! # let _ = ActivationCache::default();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod experiment;
pub mod hooks;
pub mod interp;
pub mod scenario;
pub mod tokenizer;
pub mod transformer;
pub mod util;

pub use backend::{MIBackend, MIModel, SpecialTokens};
pub use cache::{ActivationCache, AttentionCache};
pub use config::TransformerConfig;
pub use error::{MIError, Result};
pub use experiment::{
    Experiment, ExperimentConfig, InjectionReport, PatchingReport, RunOutcome, SweepReport,
    SweepRow, head_candidates, layer_candidates,
};
pub use hooks::{HookCache, HookPoint, HookSpec, SiteLayout};
pub use interp::attention_report::{AttentionReport, analyze_attention};
pub use interp::generation::{GenerateOptions, Generation, StopReason, generate};
pub use interp::patching::{HeadSelection, PatchSpec, overwrite, patch_hooks, run_and_capture, run_with_patch};
pub use interp::prompt::{Prompt, PromptOptions, PromptPair, TokenizedPrompt, left_pad};
pub use interp::verdict::Verdict;
pub use tokenizer::MITokenizer;
pub use transformer::GenericTransformer;
