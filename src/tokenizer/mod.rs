// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer wrapper over the `HuggingFace` `tokenizers` crate.
//!
//! [`MITokenizer`] adds what the prompt builder needs on top of plain
//! encode/decode: byte offsets per token, per-token display strings, and
//! resolution of the BOS / EOS / pad special tokens.

use std::path::Path;

use crate::error::{MIError, Result};
use crate::util::positioning::EncodingWithOffsets;

/// Special-token names tried, in order, when the caller gives no id.
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<|im_end|>", "<eos>"];
const BOS_CANDIDATES: &[&str] = &["<|endoftext|>", "<s>", "<|begin_of_text|>", "<bos>"];

/// Loaded tokenizer.
///
/// # Example
///
/// ```no_run
/// use inject_mi::MITokenizer;
///
/// # fn main() -> inject_mi::Result<()> {
/// let tok = MITokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode_raw("Please summarize the following email:")?;
/// let text = tok.decode(&ids)?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct MITokenizer {
    inner: tokenizers::Tokenizer,
}

impl MITokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            MIError::Tokenization(format!(
                "failed to load tokenizer from {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self { inner })
    }

    /// Parse a tokenizer from the bytes of a `tokenizer.json`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if the bytes are not a valid tokenizer.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| MIError::Tokenization(format!("failed to parse tokenizer: {e}")))?;
        Ok(Self { inner })
    }

    /// Wrap an already-loaded tokenizer.
    #[must_use]
    pub const fn from_hf(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }

    /// Encode text, adding special tokens per the tokenizer's post-processor.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| MIError::Tokenization(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode text without adding special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if encoding fails.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.encode_with_offsets(text)?.ids)
    }

    /// Encode text without special tokens, keeping each token's byte range.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if encoding fails.
    pub fn encode_with_offsets(&self, text: &str) -> Result<EncodingWithOffsets> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| MIError::Tokenization(format!("encode failed: {e}")))?;
        Ok(EncodingWithOffsets::new(
            encoding.get_ids().to_vec(),
            encoding.get_offsets().to_vec(),
        ))
    }

    /// Decode token ids to text. Special tokens are kept in the output.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| MIError::Tokenization(format!("decode failed: {e}")))
    }

    /// Display string for each token, decoded one id at a time.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenization`] if any id cannot be decoded.
    pub fn display_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter().map(|&id| self.decode(&[id])).collect()
    }

    /// Id of a token string, if in the vocabulary.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// End-of-text token id, looked up by common names.
    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        self.first_known(EOS_CANDIDATES)
    }

    /// Beginning-of-sequence token id, looked up by common names.
    #[must_use]
    pub fn bos_token_id(&self) -> Option<u32> {
        self.first_known(BOS_CANDIDATES)
    }

    /// Pad id from the tokenizer's padding config, if it has one.
    #[must_use]
    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner.get_padding().map(|p| p.pad_id)
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn first_known(&self, names: &[&str]) -> Option<u32> {
        names.iter().find_map(|name| self.inner.token_to_id(name))
    }
}

impl std::fmt::Debug for MITokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MITokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Whitespace-split word-level tokenizer with an `<|endoftext|>` token.
    fn word_tokenizer() -> MITokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 0, "content": "<|endoftext|>", "single_word": false,
                 "lstrip": false, "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": null,
            "pre_tokenizer": {"type": "WhitespaceSplit"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"<|endoftext|>": 0, "hello": 1, "world": 2, "[UNK]": 3},
                "unk_token": "[UNK]"
            }
        }"#;
        MITokenizer::from_bytes(json).unwrap()
    }

    #[test]
    fn encode_with_offsets_tracks_bytes() {
        let tok = word_tokenizer();
        let enc = tok.encode_with_offsets("hello world").unwrap();
        assert_eq!(enc.ids, vec![1, 2]);
        assert_eq!(enc.offsets, vec![(0, 5), (6, 11)]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tok = word_tokenizer();
        assert_eq!(tok.encode_raw("hello there").unwrap(), vec![1, 3]);
    }

    #[test]
    fn special_tokens() {
        let tok = word_tokenizer();
        assert_eq!(tok.eos_token_id(), Some(0));
        assert_eq!(tok.bos_token_id(), Some(0));
        assert_eq!(tok.pad_token_id(), None);
        assert_eq!(tok.token_to_id("world"), Some(2));
    }

    #[test]
    fn display_tokens_one_per_id() {
        let tok = word_tokenizer();
        assert_eq!(tok.display_tokens(&[1, 2]).unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn invalid_json_rejected() {
        assert!(matches!(
            MITokenizer::from_bytes("{not json"),
            Err(MIError::Tokenization(_))
        ));
    }
}
