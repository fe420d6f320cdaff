// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model file resolution: a local directory, or the `HuggingFace` Hub.
//!
//! Hub downloads go through the `hf-hub` sync API and land in the standard
//! cache (`~/.cache/huggingface/hub/`), so later runs work offline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};

use crate::error::{MIError, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";
const SHARD_INDEX: &str = "model.safetensors.index.json";

/// Paths to everything needed to load a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`.
    pub config: PathBuf,
    /// `tokenizer.json`.
    pub tokenizer: PathBuf,
    /// One or more safetensors files.
    pub weights: Vec<PathBuf>,
}

/// Index structure for sharded safetensors models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    /// Maps weight name to shard filename.
    weight_map: HashMap<String, String>,
}

impl ModelFiles {
    /// Resolve `model` as a local directory if one exists at that path,
    /// otherwise as a Hub repository id.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Download`] if a file is missing or cannot be
    /// fetched, and [`MIError::Config`] if the shard index is malformed.
    pub fn resolve(model: &str) -> Result<Self> {
        let path = Path::new(model);
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_hub(model)
        }
    }

    /// Resolve files inside a local model directory.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn from_dir(dir: &Path) -> Result<Self> {
        tracing::info!(dir = %dir.display(), "resolving local model files");
        let local = |name: &str| -> Result<PathBuf> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(MIError::Download(format!(
                    "{name} not found in {}",
                    dir.display()
                )))
            }
        };
        let weights = match local(SHARD_INDEX) {
            Ok(index) => shard_names(&index)?
                .iter()
                .map(|name| local(name))
                .collect::<Result<Vec<_>>>()?,
            Err(_) => vec![local(SINGLE_WEIGHTS)?],
        };
        Ok(Self {
            config: local(CONFIG_FILE)?,
            tokenizer: local(TOKENIZER_FILE)?,
            weights,
        })
    }

    /// Fetch files from the Hub (or its local cache).
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve).
    pub fn from_hub(model_id: &str) -> Result<Self> {
        tracing::info!(model_id, "resolving model files from the HuggingFace Hub");
        let api = Api::new().map_err(|e| MIError::Download(format!("hub client: {e}")))?;
        let repo = api.repo(Repo::new(model_id.to_owned(), RepoType::Model));

        let weights = match repo.get(SHARD_INDEX) {
            Ok(index) => {
                let shards = shard_names(&index)?;
                tracing::info!(shards = shards.len(), "model is sharded");
                shards
                    .iter()
                    .map(|name| fetch(&repo, model_id, name))
                    .collect::<Result<Vec<_>>>()?
            }
            Err(_) => vec![fetch(&repo, model_id, SINGLE_WEIGHTS)?],
        };
        Ok(Self {
            config: fetch(&repo, model_id, CONFIG_FILE)?,
            tokenizer: fetch(&repo, model_id, TOKENIZER_FILE)?,
            weights,
        })
    }

    /// Read and parse `config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] if the file cannot be read and
    /// [`MIError::Config`] if it is not valid JSON.
    pub fn read_config(&self) -> Result<serde_json::Value> {
        let text = std::fs::read_to_string(&self.config)?;
        serde_json::from_str(&text)
            .map_err(|e| MIError::Config(format!("parse {}: {e}", self.config.display())))
    }
}

fn fetch(repo: &ApiRepo, model_id: &str, name: &str) -> Result<PathBuf> {
    repo.get(name)
        .map_err(|e| MIError::Download(format!("{model_id}/{name}: {e}")))
}

/// Unique shard filenames listed in a safetensors index, sorted.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(index_path)?;
    let index: SafetensorsIndex = serde_json::from_str(&text)
        .map_err(|e| MIError::Config(format!("parse {}: {e}", index_path.display())))?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}
