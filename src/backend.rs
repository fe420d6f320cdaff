// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`MIBackend`] is the trait every model backend implements.
//! [`MIModel`] wraps a backend with its device and is the handle the
//! engine, generation loop and experiments take by shared reference.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::TransformerConfig;
use crate::download::ModelFiles;
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookSpec};
use crate::transformer::GenericTransformer;

// ---------------------------------------------------------------------------
// MIBackend trait
// ---------------------------------------------------------------------------

/// Special token ids declared by a model's configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Beginning-of-sequence.
    pub bos: Option<u32>,
    /// End-of-sequence.
    pub eos: Option<u32>,
    /// Padding.
    pub pad: Option<u32>,
}

/// Unified interface for model backends with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method takes a [`HookSpec`]
/// naming what to capture and what to patch; the backend returns a
/// [`HookCache`] holding the logits plus the captured activations.
pub trait MIBackend: Send + Sync {
    /// Number of layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Number of attention heads.
    fn num_heads(&self) -> usize;

    /// Longest sequence the model accepts, if bounded.
    fn max_position_embeddings(&self) -> Option<usize> {
        None
    }

    /// Special token ids from the model config.
    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens::default()
    }

    /// Forward pass with hook capture and patching.
    ///
    /// With an empty `hooks` this must equal a plain forward pass.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: [`HookCache`] with logits `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor failures and
    /// [`MIError::ShapeMismatch`] if a registered patch does not fit.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;
}

// ---------------------------------------------------------------------------
// MIModel
// ---------------------------------------------------------------------------

/// A backend plus the device it lives on.
pub struct MIModel {
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn MIBackend>,
    device: Device,
}

impl MIModel {
    /// Load a model from a local directory or `HuggingFace` model id.
    ///
    /// # `DType` selection
    ///
    /// - **CUDA**: `BF16`
    /// - **CPU**: `F32`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Download`] if files cannot be resolved,
    /// [`MIError::Config`] if the model type is unsupported, or
    /// [`MIError::Model`] if weight loading fails.
    pub fn from_pretrained(model: &str, force_cpu: bool) -> Result<Self> {
        let files = ModelFiles::resolve(model)?;
        Self::from_files(&files, force_cpu)
    }

    /// Load a model from already-resolved files.
    ///
    /// # Errors
    ///
    /// Same as [`from_pretrained`](Self::from_pretrained).
    pub fn from_files(files: &ModelFiles, force_cpu: bool) -> Result<Self> {
        let device = select_device(force_cpu)?;
        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };

        let config = TransformerConfig::from_hf_config(&files.read_config()?)?;
        tracing::info!(
            weights = files.weights.len(),
            ?dtype,
            cuda = device.is_cuda(),
            "loading weights"
        );
        let vb = create_var_builder(&files.weights, dtype, &device)?;
        let transformer = GenericTransformer::load(config, &device, dtype, vb)?;

        Ok(Self::new(Box::new(transformer), device))
    }

    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn MIBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    /// Longest sequence the model accepts, if bounded.
    #[must_use]
    pub fn max_position_embeddings(&self) -> Option<usize> {
        self.backend.max_position_embeddings()
    }

    /// Special token ids from the model config.
    #[must_use]
    pub fn special_tokens(&self) -> SpecialTokens {
        self.backend.special_tokens()
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: [`HookCache`] with logits `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }
}

impl std::fmt::Debug for MIModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MIModel")
            .field("layers", &self.num_layers())
            .field("heads", &self.num_heads())
            .field("hidden", &self.hidden_size())
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// CUDA GPU 0 when available and not disabled, otherwise CPU.
fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

// ---------------------------------------------------------------------------
// Weight loading
// ---------------------------------------------------------------------------

/// Buffered loading by default; memory-mapped with the `mmap` feature.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Read the whole file into RAM. Single-file checkpoints only.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let [path] = paths else {
        return Err(MIError::Config(format!(
            "{} weight files found; sharded checkpoints require the `mmap` feature",
            paths.len()
        )));
    };
    let data = std::fs::read(path)?;
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Memory-map the safetensors files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(MIError::Config("no safetensors files".into()));
    }
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}
