//! Closed, tagged error taxonomy for the engine.
//!
//! Consumers switch on [`ErrorKind`], never on the concrete variant's type identity — the
//! wire layer (`server.rs`) maps every kind to a stable JSON-RPC error code.

use std::path::PathBuf;

use thiserror::Error;

/// Stable tag attached to every [`SemanticSearchError`], independent of the human message.
///
/// This is the thing callers and the JSON-RPC boundary actually match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ModelLoadFailure,
    EmbeddingGenerationFailure,
    PathTraversal,
    InvalidFilter,
    InvalidId,
    StoreTransient,
    StoreFatal,
    ChunkerFailure,
}

impl ErrorKind {
    /// Whether this kind belongs to the `embedder-failure` family.
    pub fn is_embedder_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::ModelLoadFailure | ErrorKind::EmbeddingGenerationFailure
        )
    }

    /// Whether this kind belongs to the `security-failure` family (always fatal to the
    /// enclosing request; never degrades silently).
    pub fn is_security_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::PathTraversal | ErrorKind::InvalidFilter | ErrorKind::InvalidId
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ModelLoadFailure => "model-load-failure",
            ErrorKind::EmbeddingGenerationFailure => "embedding-generation-failure",
            ErrorKind::PathTraversal => "path-traversal",
            ErrorKind::InvalidFilter => "invalid-filter",
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::StoreTransient => "store-transient-failure",
            ErrorKind::StoreFatal => "store-fatal-failure",
            ErrorKind::ChunkerFailure => "chunker-failure",
        }
    }
}

/// The engine's single error type. Flat by design — no inheritance tree, one enum per
/// taxonomy leaf, grouped with doc comments rather than nested types.
#[derive(Debug, Error)]
pub enum SemanticSearchError {
    /// The embedding model failed to load (missing weights, cache directory unwritable, …).
    #[error("embedder model failed to load: {reason}")]
    ModelLoadFailure { reason: String },

    /// The embedding model loaded but failed to produce a vector for given input.
    #[error("embedding generation failed: {reason}")]
    EmbeddingGenerationFailure { reason: String },

    /// A resolved path escaped the configured root.
    #[error("path '{path}' is not within root '{root}'")]
    PathTraversal { path: PathBuf, root: PathBuf },

    /// A caller-supplied filter option failed the whitelist.
    #[error("invalid filter pattern: {reason}")]
    InvalidFilter { reason: String },

    /// A chunk or record id failed validation (e.g. embedded predicate control characters).
    #[error("invalid id: {reason}")]
    InvalidId { reason: String },

    /// A store operation failed but may succeed on retry (e.g. a transient I/O error).
    #[error("store operation failed (transient): {reason}")]
    StoreTransient { reason: String },

    /// A store operation failed unrecoverably (e.g. the store was closed, or the on-disk
    /// index is corrupt).
    #[error("store operation failed (fatal): {reason}")]
    StoreFatal { reason: String },

    /// Chunking a single file failed; callers treat this as non-fatal to the surrounding scan.
    #[error("failed to chunk '{path}': {reason}")]
    ChunkerFailure { path: PathBuf, reason: String },
}

impl SemanticSearchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SemanticSearchError::ModelLoadFailure { .. } => ErrorKind::ModelLoadFailure,
            SemanticSearchError::EmbeddingGenerationFailure { .. } => {
                ErrorKind::EmbeddingGenerationFailure
            }
            SemanticSearchError::PathTraversal { .. } => ErrorKind::PathTraversal,
            SemanticSearchError::InvalidFilter { .. } => ErrorKind::InvalidFilter,
            SemanticSearchError::InvalidId { .. } => ErrorKind::InvalidId,
            SemanticSearchError::StoreTransient { .. } => ErrorKind::StoreTransient,
            SemanticSearchError::StoreFatal { .. } => ErrorKind::StoreFatal,
            SemanticSearchError::ChunkerFailure { .. } => ErrorKind::ChunkerFailure,
        }
    }

    pub fn is_embedder_failure(&self) -> bool {
        self.kind().is_embedder_failure()
    }

    pub fn is_security_failure(&self) -> bool {
        self.kind().is_security_failure()
    }
}

pub type Result<T> = std::result::Result<T, SemanticSearchError>;
