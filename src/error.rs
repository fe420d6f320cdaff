// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for inject-mi.

/// Errors that can occur while building prompts, running instrumented
/// forward passes, or patching activations.
#[derive(Debug, thiserror::Error)]
pub enum MIError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Text could not be tokenized, or token ids could not be decoded.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// A site reference names a location the model does not expose.
    #[error("site not found: {0}")]
    SiteNotFound(String),

    /// A patch selection does not fit the tensor shape at its site.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A requested activation was not captured.
    #[error("hook error: {0}")]
    Hook(String),

    /// Model or experiment configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Model files could not be resolved or downloaded.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for inject-mi operations.
pub type Result<T> = std::result::Result<T, MIError>;
