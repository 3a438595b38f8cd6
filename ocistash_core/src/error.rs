//! Error types for ocistash_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ocistash_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A JSON document (index, manifest, config) could not be encoded or decoded.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// An OCI document could not be built or parsed.
    #[error("OCI document error: {source}")]
    Spec {
        #[from]
        source: oci_spec::OciSpecError,
    },

    /// Reference string does not follow the `[registry/]repository[:tag|@digest]` grammar.
    #[error("Invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Blob, manifest or reference is not present.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// An artifact could not produce the content it declared.
    #[error("Artifact production failed: {reason}")]
    ArtifactProduction { reason: String },

    /// Written content does not hash to the declared digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Written content does not have the declared size.
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    /// Invalid digest format or encoding.
    #[error("Invalid digest: {reason}")]
    InvalidDigest { reason: String },

    /// Unsupported digest algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// Directory is not a usable OCI image layout.
    #[error("Invalid layout at {path}: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },

    /// Media type cannot be handled by the operation.
    #[error("Unsupported media type: {media_type}")]
    UnsupportedMediaType { media_type: String },

    /// Operation was cancelled or ran past its deadline.
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// The transfer primitive failed while copying to a target.
    #[error("Transfer failed: {reason}")]
    Transfer { reason: String },

    /// A remote registry rejected or failed a request.
    #[error("Registry error: {reason}")]
    Registry { reason: String },
}

impl Error {
    /// Create an InvalidReference error.
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create an ArtifactProduction error.
    pub fn artifact_production(reason: impl Into<String>) -> Self {
        Error::ArtifactProduction {
            reason: reason.into(),
        }
    }

    /// Create a DigestMismatch error.
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an InvalidDigest error.
    pub fn invalid_digest(reason: impl Into<String>) -> Self {
        Error::InvalidDigest {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create an InvalidLayout error.
    pub fn invalid_layout(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidLayout {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedMediaType error.
    pub fn unsupported_media_type(media_type: impl Into<String>) -> Self {
        Error::UnsupportedMediaType {
            media_type: media_type.into(),
        }
    }

    /// Create a Cancelled error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a Transfer error.
    pub fn transfer(reason: impl Into<String>) -> Self {
        Error::Transfer {
            reason: reason.into(),
        }
    }

    /// Create a Registry error.
    pub fn registry(reason: impl Into<String>) -> Self {
        Error::Registry {
            reason: reason.into(),
        }
    }

    /// Whether this error means the requested content is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Re-wrap any failure raised while an artifact produced its content.
    ///
    /// Cancellation passes through untouched so callers can still tell the two apart.
    pub(crate) fn into_production(self) -> Self {
        match self {
            e @ (Error::ArtifactProduction { .. } | Error::Cancelled { .. }) => e,
            other => Error::artifact_production(other.to_string()),
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}
