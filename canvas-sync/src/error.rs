//! Error types for scene synchronization.

use thiserror::Error;

use crate::binding::ContentKind;
use crate::scene::NodeHandle;

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing the scene and the registry.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The scene graph has not been initialized (no layers yet).
    #[error("Scene graph is not ready")]
    SceneNotReady,

    /// No content instance with this id exists in the registry.
    #[error("{kind} not found: {id}")]
    ContentNotFound {
        /// Content type that was looked up.
        kind: ContentKind,
        /// Requested id.
        id: String,
    },

    /// A node handle no longer resolves to a scene node.
    #[error("Scene node not found: {0}")]
    NodeNotFound(NodeHandle),

    /// No layer with this id exists in the scene.
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    /// The operation is not valid for the given content type.
    #[error("Invalid operation on {kind}: {reason}")]
    InvalidOperation {
        /// Content type the operation targeted.
        kind: ContentKind,
        /// Why it was rejected.
        reason: String,
    },

    /// An upload lifecycle transition was requested from the wrong state.
    #[error("Upload {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        /// Upload (placeholder) id.
        id: String,
        /// Current phase name.
        from: &'static str,
        /// Requested phase name.
        to: &'static str,
    },

    /// No upload is tracked under this id.
    #[error("Unknown upload: {0}")]
    UnknownUpload(String),

    /// An asset reference could not be classified or decoded.
    #[error("Invalid asset reference: {0}")]
    InvalidAsset(String),

    /// Scene or snapshot serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Nothing to undo or redo, or no history for the active document.
    #[error("History error: {0}")]
    History(String),

    /// The persistence collaborator reported a failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Upload failed after all retries.
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    /// The durable asset could not be preloaded after all retries.
    #[error("Preload failed: {0}")]
    Preload(#[from] PreloadError),
}

/// Failures returned by the upload collaborator.
///
/// Uploaders never panic or throw past the boundary; every failure is one of
/// these values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// Network failure or timeout. Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend rejected the request.
    #[error("Rejected ({status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Backend message.
        message: String,
    },

    /// The payload exceeds the backend's size limit.
    #[error("Payload too large: {bytes} bytes")]
    TooLarge {
        /// Payload size in bytes.
        bytes: usize,
    },

    /// The source could not be read or has an unsupported format.
    #[error("Unsupported source: {0}")]
    Unsupported(String),
}

impl UploadError {
    /// Whether retrying the same upload may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::TooLarge { .. } | Self::Unsupported(_) => false,
        }
    }
}

/// Failures while preloading a remote asset off-tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreloadError {
    /// The object is not fetchable yet (storage/CDN eventual consistency).
    #[error("Asset not available yet: {0}")]
    NotYetAvailable(String),

    /// Network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The bytes arrived but could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),
}

impl PreloadError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotYetAvailable(_) | Self::Network(_))
    }
}

/// Failures returned by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// The project does not exist.
    #[error("Project not found: {0}")]
    NotFound(String),

    /// A newer version was saved elsewhere.
    #[error("Version conflict: expected {expected}, found {found}")]
    Conflict {
        /// Version the save was based on.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_error_retryable() {
        assert!(UploadError::Network("reset".into()).is_retryable());
        assert!(UploadError::Rejected {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(UploadError::Rejected {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!UploadError::Rejected {
            status: 403,
            message: "denied".into()
        }
        .is_retryable());
        assert!(!UploadError::TooLarge { bytes: 1 << 30 }.is_retryable());
    }

    #[test]
    fn test_preload_error_retryable() {
        assert!(PreloadError::NotYetAvailable("k".into()).is_retryable());
        assert!(!PreloadError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::ContentNotFound {
            kind: ContentKind::Image,
            id: "img-1".into(),
        };
        assert_eq!(err.to_string(), "image not found: img-1");
    }
}
