// src/drs.rs
//
// DRS (Data Repository Service) boundary. Resolution itself is an external
// service; this module only turns a resolved location into a blob.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::blob::{AnyBlob, Blob, blob_for_url_with_config};
use crate::checksum::Checksum;
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result};
use crate::gs_store::GSBlob;

pub const DRS_SCHEME: &str = "drs://";

/// Concrete storage location a DRS URI points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    /// `gs://`, `az://`, `https://` (often signed) locator
    pub url: String,
    #[serde(default)]
    pub billing_project: Option<String>,
    /// Service-account key file issued with the resolution
    #[serde(default)]
    pub credentials: Option<PathBuf>,
    /// Checksum the repository declares for the object
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

#[async_trait]
pub trait DrsResolver: Send + Sync {
    async fn resolve(&self, drs_uri: &str) -> Result<ResolvedLocation>;
}

pub fn is_drs_uri(locator: &str) -> bool {
    locator.starts_with(DRS_SCHEME)
}

/// Blob for a resolved location, carrying billing, credentials and checksum
/// into the backend that understands them.
pub fn blob_for_resolved(location: &ResolvedLocation, config: &TransferConfig) -> Result<AnyBlob> {
    match blob_for_url_with_config(&location.url, config)? {
        AnyBlob::Gs(blob) => {
            let blob = GSBlob::new(
                blob.bucket(),
                blob.key(),
                location.credentials.clone(),
                location.billing_project.clone(),
            )
            .with_chunk_size(config.chunk_size)
            .with_io_concurrency(config.io_concurrency);
            Ok(AnyBlob::Gs(blob))
        }
        AnyBlob::Url(blob) => Ok(AnyBlob::Url(blob.with_checksum(location.checksum.clone()))),
        AnyBlob::Local(_) => Err(BlobStoreError::Configuration(format!(
            "DRS resolution returned a non-cloud location: {}",
            location.url
        ))),
        other => Ok(other),
    }
}

/// Resolve `locator` through `resolver` when it is a DRS URI, otherwise
/// classify it directly.
pub async fn resolve_locator(
    locator: &str,
    resolver: Option<&dyn DrsResolver>,
    config: &TransferConfig,
) -> Result<AnyBlob> {
    if !is_drs_uri(locator) {
        return blob_for_url_with_config(locator, config);
    }
    let resolver = resolver
        .ok_or_else(|| BlobStoreError::Configuration(format!("no DRS resolver configured for {}", locator)))?;
    let location = resolver.resolve(locator).await?;
    tracing::debug!("resolved {} to {}", locator, location.url);
    blob_for_resolved(&location, config)
}
