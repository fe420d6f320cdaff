// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability operations built on the hook system.
//!
//! - [`prompt`]: baseline / variant pairs aligned by left padding.
//! - [`patching`]: capture and patched forward passes.
//! - [`generation`]: greedy decoding under a patch.
//! - [`verdict`]: leak classification of generated text.
//! - [`attention_report`]: per-head focus of the final position.

pub mod attention_report;
pub mod generation;
pub mod patching;
pub mod prompt;
pub mod verdict;
