// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caches produced by instrumented forward passes.
//!
//! - [`ActivationCache`]: every captured site of one run, keyed by site.
//! - [`AttentionCache`]: the per-layer attention patterns of a run.

mod activation;
mod attention;

pub use activation::ActivationCache;
pub use attention::AttentionCache;
