/// Error types for content-mirror operations.
///
/// This module provides the error hierarchy covering all failure modes of
/// the clone-and-translate engine. All errors are well-typed and can be
/// pattern-matched for precise handling at the HTTP boundary.
use thiserror::Error;

/// The main error type for content-mirror operations.
///
/// All fallible operations return `Result<T, MirrorError>`. Translator
/// failures are deliberately absent from most signatures: translation is
/// best-effort and call sites fall back to the source text instead of
/// propagating (see the engine).
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Missing or invalid process configuration (tokens, keys, paths)
    #[error("Configuration error: {reason}")]
    Config {
        /// What is missing or malformed, with a remediation hint
        reason: String,
    },

    /// The request itself is unusable (missing ids, wrong content type,
    /// unknown language code)
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Description of the rejected input
        reason: String,
    },

    /// An entry the operation needs does not exist in the CMS
    #[error("Entry '{id}' not found")]
    EntryNotFound {
        /// The entry id that was requested
        id: String,
    },

    /// CMS management API failure
    #[error("CMS error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Cms {
        /// HTTP status when the CMS answered, None for transport failures
        status: Option<u16>,
        /// Description of the failure
        message: String,
    },

    /// Machine-translator failure
    #[error("Translator error: {message}")]
    Translator {
        /// Description of the failure
        message: String,
    },

    /// Relationship store failure (both backends, or the fallback alone)
    #[error("Store error: {message}")]
    Store {
        /// Description of the failure
        message: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request-scoped cancellation token was triggered
    #[error("Operation cancelled")]
    Cancelled,
}

impl MirrorError {
    /// Whether a retry of an idempotent read may succeed.
    ///
    /// Transport failures and 5xx/429 responses are transient; 4xx
    /// responses and everything else are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::Cms { status, .. } => match status {
                None => true,
                Some(s) => *s >= 500 || *s == 429,
            },
            _ => false,
        }
    }
}

/// Result type alias for content-mirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
