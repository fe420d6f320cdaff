// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-offset to token-index mapping.
//!
//! Prompts mark regions of interest (the injected instruction) as byte
//! ranges into the text. After tokenization, the offset map converts those
//! ranges into exact token index ranges, independent of how a particular
//! tokenizer splits words.

use std::ops::Range;

/// Token ids together with each token's byte range in the source text.
///
/// # Example
///
/// ```
/// use inject_mi::util::positioning::EncodingWithOffsets;
///
/// let encoding = EncodingWithOffsets::new(
///     vec![1, 2, 3],
///     vec![(0, 3), (3, 4), (4, 7)],
/// );
///
/// // Bytes 3..7 touch tokens 1 and 2
/// assert_eq!(encoding.span_to_token_range(&(3..7)), Some(1..3));
/// assert_eq!(encoding.span_to_token_range(&(4..4)), None);
/// ```
#[derive(Debug, Clone)]
pub struct EncodingWithOffsets {
    /// Token IDs.
    pub ids: Vec<u32>,
    /// Byte range of each token: `(start, end)`.
    pub offsets: Vec<(usize, usize)>,
}

impl EncodingWithOffsets {
    /// Create a new encoding with offsets.
    #[must_use]
    pub const fn new(ids: Vec<u32>, offsets: Vec<(usize, usize)>) -> Self {
        Self { ids, offsets }
    }

    /// All token indices overlapping the byte range `start_char..end_char`.
    ///
    /// An empty range overlaps nothing.
    #[must_use]
    pub fn char_range_to_tokens(&self, start_char: usize, end_char: usize) -> Vec<usize> {
        if start_char >= end_char {
            return Vec::new();
        }
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(idx, (start, end))| {
                (*end > start_char && *start < end_char).then_some(idx)
            })
            .collect()
    }

    /// Contiguous token range covering every token that overlaps `span`.
    ///
    /// Returns `None` for an empty span or one no token touches.
    #[must_use]
    pub fn span_to_token_range(&self, span: &Range<usize>) -> Option<Range<usize>> {
        let hits = self.char_range_to_tokens(span.start, span.end);
        let first = *hits.first()?;
        let last = *hits.last()?;
        Some(first..last + 1)
    }

    /// Number of tokens.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the encoding is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// "The password is Orion-17" split into words and sub-words.
    fn sample_encoding() -> EncodingWithOffsets {
        EncodingWithOffsets::new(
            vec![10, 11, 12, 13, 14, 15],
            vec![(0, 3), (3, 12), (12, 15), (15, 21), (21, 22), (22, 24)],
        )
    }

    #[test]
    fn span_covers_partial_tokens() {
        let encoding = sample_encoding();
        // "Orion-17" starts mid-token 3 (" Orion") and ends at the end.
        assert_eq!(encoding.span_to_token_range(&(16..24)), Some(3..6));
        assert_eq!(encoding.char_range_to_tokens(3, 12), vec![1]);
    }

    #[test]
    fn empty_or_outside_span() {
        let encoding = sample_encoding();
        assert_eq!(encoding.span_to_token_range(&(5..5)), None);
        assert_eq!(encoding.span_to_token_range(&(30..40)), None);
        // Empty span on a token boundary and inside a token.
        assert_eq!(encoding.span_to_token_range(&(12..12)), None);
        assert!(encoding.char_range_to_tokens(16, 16).is_empty());
        assert!(encoding.char_range_to_tokens(20, 16).is_empty());
        assert_eq!(encoding.len(), 6);
    }
}
