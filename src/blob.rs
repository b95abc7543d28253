// src/blob.rs
//
// Backend-agnostic blob contract.
//
// - `Blob`: one object in one backend (exists/size/get/put/delete, checksums,
//   ordered part streaming, downloads, multipart writers)
// - `BlobStore`: one backend + one addressing root, hands out blobs and lists them
// - `AnyBlob`: closed set of the supported backends, used by the copy engine to
//   pick a strategy with a plain `match`
// - `BlobDescriptor`: plain-data form of a blob (locator plus credentials and
//   billing); a blob rebuilt from one re-establishes its client lazily

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::azure_store::AzureBlob;
use crate::checksum::{Checksum, ChecksumAlgorithm, ChecksumHasher};
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result, io_error};
use crate::gs_store::GSBlob;
use crate::local_store::LocalBlob;
use crate::part::{Part, PartStream, ProgressStream};
use crate::url_store::URLBlob;

/// Incremental multipart upload session.
///
/// Parts may arrive in any order; they are reassembled by `Part::number`.
/// `close` consumes the writer so it can only finalize once. A writer dropped
/// without `close` never produces the destination object and cleans up any
/// staged data on a best-effort basis.
#[async_trait]
pub trait PartWriter: Send {
    async fn put_part(&mut self, part: Part) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Blob: Send + Sync {
    /// Backend-relative identifier.
    fn key(&self) -> &str;

    /// Fully-qualified locator; a pure function of backend identity + key.
    fn url(&self) -> String;

    /// `Ok(false)` for a missing object, never `NotFound`.
    async fn exists(&self) -> Result<bool>;

    async fn size(&self) -> Result<u64>;

    /// Whole object in memory. Large objects should go through `iter_content`.
    async fn get(&self) -> Result<Bytes>;

    /// Full overwrite; creates the object when absent.
    async fn put(&self, data: Bytes) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    /// Backend-native digest, `None` when the backend keeps none.
    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>>;

    /// Fresh ordered sequence of parts covering the whole object.
    async fn iter_content(&self) -> Result<PartStream>;

    /// Stream the object into a local file, yielding bytes written per part.
    /// Drain the stream to complete the download.
    async fn download_iter(&self, path: &Path) -> Result<ProgressStream>;

    async fn download(&self, path: &Path) -> Result<()> {
        let mut progress = self.download_iter(path).await?;
        while let Some(written) = progress.next().await {
            written?;
        }
        Ok(())
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    type Blob: Blob;

    /// Locator prefix identifying the backend (`gs://`, `https://`, ...).
    fn schema(&self) -> &'static str;

    fn chunk_size(&self) -> usize;

    /// Deterministic: the same key always yields an equivalent blob.
    fn blob(&self, key: &str) -> Self::Blob;

    /// Blobs whose key starts with `prefix`, in backend order.
    fn list(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Result<Self::Blob>> + Send + 'static>>;
}

// ============================================================================
// Shared download path for the network backends
// ============================================================================

/// Write `parts` to `path`, hashing as they land, and verify against `expected`.
///
/// On a mismatch the partial file is removed and `ChecksumMismatch` is raised.
/// With no `expected` checksum nothing can be verified; the caller is expected to
/// have logged that before starting.
pub(crate) fn download_parts(
    url: String,
    mut parts: PartStream,
    path: PathBuf,
    expected: Option<Checksum>,
) -> ProgressStream {
    Box::pin(async_stream::try_stream! {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, &path.display().to_string()))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| io_error(e, &path.display().to_string()))?;
        let mut hasher = expected.as_ref().map(|c| ChecksumHasher::new(c.algorithm));

        while let Some(part) = parts.next().await {
            let part = part?;
            if let Some(h) = hasher.as_mut() {
                h.update(&part.data);
            }
            file.write_all(&part.data)
                .await
                .map_err(|e| io_error(e, &path.display().to_string()))?;
            yield part.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(e, &path.display().to_string()))?;
        drop(file);

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            let actual = hasher.finalize();
            if actual != expected {
                let _ = tokio::fs::remove_file(&path).await;
                Err::<(), _>(BlobStoreError::ChecksumMismatch { url: url.clone(), expected, actual })?;
            } else {
                debug!("download of {} verified ({})", url, actual);
            }
        }
    })
}

/// Pick the first available checksum in preference order: crc32c, md5, etag.
pub(crate) fn preferred_checksum(candidates: &[Checksum]) -> Option<Checksum> {
    [ChecksumAlgorithm::Crc32c, ChecksumAlgorithm::Md5, ChecksumAlgorithm::ETag]
        .iter()
        .find_map(|alg| candidates.iter().find(|c| c.algorithm == *alg).cloned())
}

pub(crate) fn warn_unverified(url: &str) {
    warn!("no checksum available for {}; integrity check skipped", url);
}

// ============================================================================
// Closed backend set
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Local,
    Gs,
    Azure,
    Url,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlobKind::Local => "LocalBlob",
            BlobKind::Gs => "GSBlob",
            BlobKind::Azure => "AzureBlob",
            BlobKind::Url => "URLBlob",
        })
    }
}

/// Plain-data blob identity: no clients, no open handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BlobDescriptor {
    Local {
        path: PathBuf,
    },
    Gs {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        billing_project: Option<String>,
    },
    Azure {
        account: String,
        container: String,
        key: String,
    },
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<Checksum>,
    },
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "BlobDescriptor", from = "BlobDescriptor")]
pub enum AnyBlob {
    Local(LocalBlob),
    Gs(GSBlob),
    Azure(AzureBlob),
    Url(URLBlob),
}

impl AnyBlob {
    pub fn kind(&self) -> BlobKind {
        match self {
            AnyBlob::Local(_) => BlobKind::Local,
            AnyBlob::Gs(_) => BlobKind::Gs,
            AnyBlob::Azure(_) => BlobKind::Azure,
            AnyBlob::Url(_) => BlobKind::Url,
        }
    }

    pub fn descriptor(&self) -> BlobDescriptor {
        match self {
            AnyBlob::Local(b) => b.descriptor(),
            AnyBlob::Gs(b) => b.descriptor(),
            AnyBlob::Azure(b) => b.descriptor(),
            AnyBlob::Url(b) => b.descriptor(),
        }
    }

    pub fn from_descriptor(descriptor: BlobDescriptor) -> Self {
        match descriptor {
            BlobDescriptor::Local { path } => AnyBlob::Local(LocalBlob::from_path(path)),
            BlobDescriptor::Gs { bucket, key, credentials, billing_project } => {
                AnyBlob::Gs(GSBlob::new(bucket, key, credentials, billing_project))
            }
            BlobDescriptor::Azure { account, container, key } => {
                AnyBlob::Azure(AzureBlob::new(account, container, key))
            }
            BlobDescriptor::Url { url, checksum } => AnyBlob::Url(URLBlob::new(url).with_checksum(checksum)),
        }
    }

    /// Checksum algorithm the backend reports natively, if any.
    pub fn native_checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        match self {
            AnyBlob::Local(_) | AnyBlob::Url(_) => None,
            AnyBlob::Gs(_) => Some(ChecksumAlgorithm::Crc32c),
            AnyBlob::Azure(_) => Some(ChecksumAlgorithm::Md5),
        }
    }

    /// Apply transfer tuning (part size, prefetch width).
    pub fn configured(self, config: &TransferConfig) -> Self {
        match self {
            AnyBlob::Local(b) => AnyBlob::Local(b.with_chunk_size(config.chunk_size)),
            AnyBlob::Gs(b) => {
                AnyBlob::Gs(b.with_chunk_size(config.chunk_size).with_io_concurrency(config.io_concurrency))
            }
            AnyBlob::Azure(b) => {
                AnyBlob::Azure(b.with_chunk_size(config.chunk_size).with_io_concurrency(config.io_concurrency))
            }
            AnyBlob::Url(b) => {
                AnyBlob::Url(b.with_chunk_size(config.chunk_size).with_io_concurrency(config.io_concurrency))
            }
        }
    }

    fn inner(&self) -> &dyn Blob {
        match self {
            AnyBlob::Local(b) => b,
            AnyBlob::Gs(b) => b,
            AnyBlob::Azure(b) => b,
            AnyBlob::Url(b) => b,
        }
    }
}

impl From<AnyBlob> for BlobDescriptor {
    fn from(blob: AnyBlob) -> Self {
        blob.descriptor()
    }
}

impl From<BlobDescriptor> for AnyBlob {
    fn from(descriptor: BlobDescriptor) -> Self {
        AnyBlob::from_descriptor(descriptor)
    }
}

impl fmt::Debug for AnyBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.url())
    }
}

#[async_trait]
impl Blob for AnyBlob {
    fn key(&self) -> &str {
        self.inner().key()
    }

    fn url(&self) -> String {
        self.inner().url()
    }

    async fn exists(&self) -> Result<bool> {
        self.inner().exists().await
    }

    async fn size(&self) -> Result<u64> {
        self.inner().size().await
    }

    async fn get(&self) -> Result<Bytes> {
        self.inner().get().await
    }

    async fn put(&self, data: Bytes) -> Result<()> {
        self.inner().put(data).await
    }

    async fn delete(&self) -> Result<()> {
        self.inner().delete().await
    }

    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>> {
        self.inner().cloud_native_checksum().await
    }

    async fn iter_content(&self) -> Result<PartStream> {
        self.inner().iter_content().await
    }

    async fn download_iter(&self, path: &Path) -> Result<ProgressStream> {
        self.inner().download_iter(path).await
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>> {
        self.inner().part_writer().await
    }
}

// ============================================================================
// Locator dispatch
// ============================================================================

/// Classify a locator string and build the matching blob.
///
/// | prefix               | backend |
/// |----------------------|---------|
/// | `gs://bucket/key`    | GCS (bare `gs://bucket` is a configuration error) |
/// | `az://acct/cont/key` | Azure |
/// | `http://`, `https://`| read-only URL |
/// | anything else        | local path, made absolute |
pub fn blob_for_url(url: &str) -> Result<AnyBlob> {
    if url.starts_with("gs://") {
        Ok(AnyBlob::Gs(GSBlob::from_url(url)?))
    } else if url.starts_with("az://") {
        Ok(AnyBlob::Azure(AzureBlob::from_url(url)?))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(AnyBlob::Url(URLBlob::new(url)))
    } else {
        let path = std::path::absolute(url)
            .map_err(|e| BlobStoreError::Configuration(format!("invalid local path {}: {}", url, e)))?;
        Ok(AnyBlob::Local(LocalBlob::from_path(path)))
    }
}

/// `blob_for_url` with transfer tuning applied.
pub fn blob_for_url_with_config(url: &str, config: &TransferConfig) -> Result<AnyBlob> {
    Ok(blob_for_url(url)?.configured(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_for_url_gs() {
        let blob = blob_for_url("gs://b/k").unwrap();
        match blob {
            AnyBlob::Gs(ref gs) => {
                assert_eq!(gs.bucket(), "b");
                assert_eq!(gs.key(), "k");
            }
            other => panic!("expected GSBlob, got {:?}", other),
        }
        assert_eq!(blob.url(), "gs://b/k");
    }

    #[test]
    fn test_blob_for_url_gs_nested_key() {
        let blob = blob_for_url("gs://bucket/a/b/c.vcf.gz").unwrap();
        assert_eq!(blob.key(), "a/b/c.vcf.gz");
    }

    #[test]
    fn test_blob_for_url_gs_without_key_is_configuration_error() {
        for url in ["gs://b", "gs://b/", "gs://"] {
            match blob_for_url(url) {
                Err(BlobStoreError::Configuration(_)) => {}
                other => panic!("expected configuration error for {}, got {:?}", url, other.map(|b| b.url())),
            }
        }
    }

    #[test]
    fn test_blob_for_url_http() {
        assert_eq!(blob_for_url("http://x/y").unwrap().kind(), BlobKind::Url);
        let blob = blob_for_url("https://example.org/data/sample.cram").unwrap();
        assert_eq!(blob.kind(), BlobKind::Url);
        assert_eq!(blob.url(), "https://example.org/data/sample.cram");
    }

    #[test]
    fn test_blob_for_url_local_relative_is_absolute() {
        let blob = blob_for_url("relative/path").unwrap();
        assert_eq!(blob.kind(), BlobKind::Local);
        let expected = std::env::current_dir().unwrap().join("relative/path");
        assert_eq!(blob.key(), expected.display().to_string());
        assert!(Path::new(blob.key()).is_absolute());
    }

    #[test]
    fn test_blob_for_url_azure() {
        let blob = blob_for_url("az://acct/cont/dir/file.bam").unwrap();
        assert_eq!(blob.kind(), BlobKind::Azure);
        assert_eq!(blob.key(), "dir/file.bam");
        assert!(blob_for_url("az://acct/cont").is_err());
    }

    #[test]
    fn test_descriptor_round_trip_preserves_identity() {
        let blob = AnyBlob::Gs(GSBlob::new("bkt", "path/obj", None, Some("billing-proj".to_string())));
        let json = serde_json::to_string(&blob).unwrap();
        assert!(json.contains("\"backend\":\"gs\""));
        assert!(json.contains("billing-proj"));
        let back: AnyBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url(), blob.url());
        assert_eq!(back.descriptor(), blob.descriptor());
    }

    #[test]
    fn test_preferred_checksum_order() {
        let etag = Checksum::from_etag("\"5eb63bbbe01eeed093cb22bb8f5acdc3\"").unwrap();
        let md5 = Checksum::md5("XrY7u+Ae7tCTyyK7j1rNww==");
        let crc = Checksum::crc32c("yZRlqg==");
        assert_eq!(preferred_checksum(&[etag.clone(), md5.clone(), crc.clone()]), Some(crc));
        assert_eq!(preferred_checksum(&[etag.clone(), md5.clone()]), Some(md5));
        assert_eq!(preferred_checksum(&[etag.clone()]), Some(etag));
        assert_eq!(preferred_checksum(&[]), None);
    }
}
