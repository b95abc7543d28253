// src/error.rs
//
// Error taxonomy shared by every blob backend and the copy engine.

use thiserror::Error;

use crate::checksum::Checksum;

pub type Result<T, E = BlobStoreError> = std::result::Result<T, E>;

/// Root error kind for all blob store operations.
#[derive(Error, Debug)]
pub enum BlobStoreError {
    /// Object absent or inaccessible at the backend.
    #[error("blob not found: {url}")]
    NotFound { url: String },

    /// Content integrity verification failed after a transfer.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: Checksum,
        actual: Checksum,
    },

    /// Backend combination or operation the copy engine does not support.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Malformed locator or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport/authentication failures passed through from the backend.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl BlobStoreError {
    pub fn not_found(url: impl Into<String>) -> Self {
        BlobStoreError::NotFound { url: url.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobStoreError::NotFound { .. })
    }
}

/// Translate a filesystem error, mapping missing files to `NotFound`.
pub(crate) fn io_error(err: std::io::Error, url: &str) -> BlobStoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BlobStoreError::not_found(url)
    } else {
        BlobStoreError::Backend(anyhow::Error::new(err).context(format!("I/O failed for {}", url)))
    }
}
