// src/gs_store.rs
//
// Google Cloud Storage blob backend.
//
// - GSBlob is a descriptor (bucket, key, credentials file, billing project)
//   plus a per-blob lazily connected `GcsApi` handle
// - chunked reads prefetch up to `io_concurrency` ranges ahead of the consumer
// - intra-GCS copies use the resumable rewrite API, looping on the
//   continuation token until the service reports completion
// - multipart writes upload parts as temporary objects and compose them on close

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::blob::{Blob, BlobDescriptor, BlobStore, PartWriter, download_parts, warn_unverified};
use crate::checksum::Checksum;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_IO_CONCURRENCY, GCS_COMPOSE_MAX_SOURCES};
use crate::error::{BlobStoreError, Result};
use crate::gcs_client::{GcloudStorageApi, GcsApi, ObjectPath, RewriteProgress, parse_gcs_uri};
use crate::part::{Part, PartStream, ProgressStream, ranged_parts};

type ApiCell = Arc<OnceCell<Arc<dyn GcsApi>>>;

#[derive(Clone)]
pub struct GSBlob {
    bucket: String,
    key: String,
    credentials: Option<PathBuf>,
    billing_project: Option<String>,
    chunk_size: usize,
    io_concurrency: usize,
    client: ApiCell,
}

impl std::fmt::Debug for GSBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GSBlob")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("billing_project", &self.billing_project)
            .finish_non_exhaustive()
    }
}

impl GSBlob {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        credentials: Option<PathBuf>,
        billing_project: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            credentials,
            billing_project,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            client: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let (bucket, key) = parse_gcs_uri(url)?;
        Ok(Self::new(bucket, key, None, None))
    }

    /// Use an already connected API handle instead of connecting lazily.
    pub fn with_api(mut self, api: Arc<dyn GcsApi>) -> Self {
        self.client = Arc::new(OnceCell::new_with(Some(api)));
        self
    }

    pub fn with_billing_project(mut self, project: Option<String>) -> Self {
        self.billing_project = project;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_io_concurrency(mut self, io_concurrency: usize) -> Self {
        self.io_concurrency = io_concurrency.max(1);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn billing_project(&self) -> Option<&str> {
        self.billing_project.as_deref()
    }

    /// Requester-pays blobs are copied client-side, never by rewrite.
    pub fn requires_billing(&self) -> bool {
        self.billing_project.is_some()
    }

    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::Gs {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            credentials: self.credentials.clone(),
            billing_project: self.billing_project.clone(),
        }
    }

    fn path(&self) -> ObjectPath {
        ObjectPath::new(self.bucket.clone(), self.key.clone())
    }

    /// Memoized client; connects on first use in whichever task gets here first.
    async fn client(&self) -> Result<Arc<dyn GcsApi>> {
        let api = self
            .client
            .get_or_try_init(|| GcloudStorageApi::connect_shared(self.credentials.clone(), self.billing_project.clone()))
            .await?;
        Ok(Arc::clone(api))
    }

    /// Server-side copy of `src` into this blob, yielding bytes copied per call.
    ///
    /// Both blobs must be free of requester-pays attribution. Copying a blob
    /// onto itself is a no-op. Drain the stream to complete the copy.
    pub async fn copy_from_iter(&self, src: &GSBlob) -> Result<ProgressStream> {
        if self.requires_billing() || src.requires_billing() {
            return Err(BlobStoreError::UnsupportedOperation(format!(
                "rewrite from {} to {} with requester-pays attribution",
                src.url(),
                self.url()
            )));
        }
        if self.bucket == src.bucket && self.key == src.key {
            debug!("copy of {} onto itself skipped", self.url());
            return Ok(Box::pin(futures::stream::empty()));
        }
        let api = self.client().await?;
        Ok(rewrite_stream(api, src.path(), self.path()))
    }
}

/// Progress of a resumable rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteState {
    NotStarted,
    InProgress(String),
    Done,
}

impl RewriteState {
    /// Token to send with the next call, `None` before the first call.
    pub fn token(&self) -> Option<String> {
        match self {
            RewriteState::InProgress(token) => Some(token.clone()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RewriteState::Done)
    }

    /// Next state after a rewrite response.
    pub fn advance(self, response: &RewriteProgress) -> Self {
        match (&response.rewrite_token, response.done) {
            (Some(token), false) => RewriteState::InProgress(token.clone()),
            _ => RewriteState::Done,
        }
    }
}

/// Drive rewrite calls until the service stops returning a continuation token.
pub fn rewrite_stream(api: Arc<dyn GcsApi>, src: ObjectPath, dst: ObjectPath) -> ProgressStream {
    Box::pin(async_stream::try_stream! {
        let mut state = RewriteState::NotStarted;
        let mut copied = 0u64;
        while !state.is_done() {
            let response = api.rewrite(&src, &dst, state.token()).await?;
            let delta = response.total_bytes_rewritten.saturating_sub(copied);
            copied = response.total_bytes_rewritten.max(copied);
            state = state.advance(&response);
            debug!("rewrite {} -> {}: {}/{} bytes", src.url(), dst.url(), copied, response.object_size);
            yield delta;
        }
    })
}

#[async_trait]
impl Blob for GSBlob {
    fn key(&self) -> &str {
        &self.key
    }

    fn url(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.key)
    }

    async fn exists(&self) -> Result<bool> {
        match self.client().await?.stat(&self.path()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.client().await?.stat(&self.path()).await?.size)
    }

    async fn get(&self) -> Result<Bytes> {
        self.client().await?.download(&self.path(), None).await
    }

    async fn put(&self, data: Bytes) -> Result<()> {
        self.client().await?.upload(&self.path(), data).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.client().await?.delete(&self.path()).await
    }

    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>> {
        let meta = self.client().await?.stat(&self.path()).await?;
        Ok(meta.crc32c.map(Checksum::crc32c))
    }

    async fn iter_content(&self) -> Result<PartStream> {
        let api = self.client().await?;
        let path = self.path();
        let size = api.stat(&path).await?.size;
        Ok(ranged_parts(self.url(), size, self.chunk_size, self.io_concurrency, move |offset, length| {
            let api = Arc::clone(&api);
            let path = path.clone();
            async move { api.download(&path, Some((offset, offset + length - 1))).await }
        }))
    }

    async fn download_iter(&self, path: &Path) -> Result<ProgressStream> {
        let api = self.client().await?;
        let meta = api.stat(&self.path()).await?;
        let expected = meta.crc32c.map(Checksum::crc32c);
        if expected.is_none() {
            warn_unverified(&self.url());
        }
        let parts = self.iter_content().await?;
        Ok(download_parts(self.url(), parts, path.to_path_buf(), expected))
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>> {
        let api = self.client().await?;
        Ok(Box::new(GsPartWriter::new(api, self.path(), self.io_concurrency)))
    }
}

/// Multipart upload by compose.
///
/// Each part becomes a temporary object next to the destination; `close`
/// composes them in part order (at most 32 sources per compose, recursively)
/// and deletes the temporaries.
pub struct GsPartWriter {
    api: Arc<dyn GcsApi>,
    dest: ObjectPath,
    upload_prefix: String,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<(usize, String)>>,
    uploaded: BTreeMap<usize, String>,
    closed: bool,
}

impl GsPartWriter {
    pub fn new(api: Arc<dyn GcsApi>, dest: ObjectPath, max_in_flight: usize) -> Self {
        let nonce = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let upload_prefix = format!("{}.tnu-upload-{:x}", dest.object, nonce);
        Self {
            api,
            dest,
            upload_prefix,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: JoinSet::new(),
            uploaded: BTreeMap::new(),
            closed: false,
        }
    }

    fn record(&mut self, joined: std::result::Result<Result<(usize, String)>, tokio::task::JoinError>) -> Result<()> {
        let (number, name) = joined.map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("part upload task failed: {}", e)))??;
        self.uploaded.insert(number, name);
        Ok(())
    }

    /// Names of every temporary object this writer may have created.
    fn temporaries(&self) -> Vec<String> {
        self.uploaded.values().cloned().collect()
    }

    async fn compose_all(&self, mut names: Vec<String>) -> Result<Vec<String>> {
        let mut intermediates = Vec::new();
        let mut round = 0;
        while names.len() > GCS_COMPOSE_MAX_SOURCES {
            let mut next = Vec::with_capacity(names.len().div_ceil(GCS_COMPOSE_MAX_SOURCES));
            for (i, group) in names.chunks(GCS_COMPOSE_MAX_SOURCES).enumerate() {
                let name = format!("{}.compose-{}-{:06}", self.upload_prefix, round, i);
                self.api.compose(&self.dest.sibling(name.clone()), group).await?;
                intermediates.push(name.clone());
                next.push(name);
            }
            names = next;
            round += 1;
        }
        self.api.compose(&self.dest, &names).await?;
        Ok(intermediates)
    }

    async fn delete_all(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.api.delete(&self.dest.sibling(name.clone())).await {
                warn!("failed to delete temporary part {}: {}", name, e);
            }
        }
    }
}

#[async_trait]
impl PartWriter for GsPartWriter {
    async fn put_part(&mut self, part: Part) -> Result<()> {
        // Surface failures from earlier uploads before queueing more work
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined)?;
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("part upload semaphore closed: {}", e)))?;
        let api = Arc::clone(&self.api);
        let name = format!("{}.{:06}", self.upload_prefix, part.number);
        let path = self.dest.sibling(name.clone());
        self.tasks.spawn(async move {
            let _permit = permit;
            api.upload(&path, part.data).await?;
            Ok((part.number, name))
        });
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined)?;
        }
        if let Some((last, _)) = self.uploaded.last_key_value() {
            if *last + 1 != self.uploaded.len() {
                return Err(BlobStoreError::Backend(anyhow::anyhow!(
                    "cannot finalize {}: parts missing ({} uploaded, highest number {})",
                    self.dest.url(),
                    self.uploaded.len(),
                    last
                )));
            }
        }

        if self.uploaded.is_empty() {
            self.api.upload(&self.dest, Bytes::new()).await?;
        } else {
            let names = self.temporaries();
            let result = self.compose_all(names.clone()).await;
            let intermediates = match &result {
                Ok(intermediates) => intermediates.clone(),
                Err(_) => Vec::new(),
            };
            self.delete_all(&names).await;
            self.delete_all(&intermediates).await;
            self.uploaded.clear();
            result?;
        }
        self.closed = true;
        debug!("multipart upload of {} complete", self.dest.url());
        Ok(())
    }
}

impl Drop for GsPartWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // JoinSet aborts in-flight uploads on drop; remove what already landed.
        while let Some(joined) = self.tasks.try_join_next() {
            if let Ok(Ok((number, name))) = joined {
                self.uploaded.insert(number, name);
            }
        }
        let names = self.temporaries();
        if names.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime to clean up {} temporary parts of {}", names.len(), self.dest.url());
            return;
        };
        let api = Arc::clone(&self.api);
        let dest = self.dest.clone();
        handle.spawn(async move {
            for name in names {
                let _ = api.delete(&dest.sibling(name)).await;
            }
        });
    }
}

/// One bucket, optionally billed to a requester-pays project.
#[derive(Clone)]
pub struct GSBlobStore {
    bucket: String,
    credentials: Option<PathBuf>,
    billing_project: Option<String>,
    chunk_size: usize,
    io_concurrency: usize,
    client: ApiCell,
}

impl GSBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            credentials: None,
            billing_project: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            client: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_api(mut self, api: Arc<dyn GcsApi>) -> Self {
        self.client = Arc::new(OnceCell::new_with(Some(api)));
        self
    }

    pub fn with_credentials(mut self, credentials: Option<PathBuf>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_billing_project(mut self, project: Option<String>) -> Self {
        self.billing_project = project;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_io_concurrency(mut self, io_concurrency: usize) -> Self {
        self.io_concurrency = io_concurrency.max(1);
        self
    }

    async fn client(&self) -> Result<Arc<dyn GcsApi>> {
        let api = self
            .client
            .get_or_try_init(|| GcloudStorageApi::connect_shared(self.credentials.clone(), self.billing_project.clone()))
            .await?;
        Ok(Arc::clone(api))
    }
}

impl BlobStore for GSBlobStore {
    type Blob = GSBlob;

    fn schema(&self) -> &'static str {
        "gs://"
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn blob(&self, key: &str) -> GSBlob {
        GSBlob {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            credentials: self.credentials.clone(),
            billing_project: self.billing_project.clone(),
            chunk_size: self.chunk_size,
            io_concurrency: self.io_concurrency,
            client: Arc::clone(&self.client),
        }
    }

    /// Pages through the listing using `next_page_token` until exhausted.
    fn list(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Result<GSBlob>> + Send + 'static>> {
        let store = self.clone();
        let prefix = prefix.to_string();
        Box::pin(async_stream::try_stream! {
            let api = store.client().await?;
            let mut page_token: Option<String> = None;
            loop {
                let page = api
                    .list_page(&store.bucket, Some(&prefix), page_token.take())
                    .await?;
                for obj in page.objects {
                    yield store.blob(&obj.name);
                }
                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: u64, token: Option<&str>, done: bool) -> RewriteProgress {
        RewriteProgress {
            total_bytes_rewritten: total,
            object_size: 100,
            done,
            rewrite_token: token.map(str::to_string),
        }
    }

    #[test]
    fn test_rewrite_state_transitions() {
        let state = RewriteState::NotStarted;
        assert_eq!(state.token(), None);
        let state = state.advance(&progress(40, Some("t1"), false));
        assert_eq!(state, RewriteState::InProgress("t1".to_string()));
        assert_eq!(state.token().as_deref(), Some("t1"));
        let state = state.advance(&progress(100, None, true));
        assert!(state.is_done());
    }

    #[test]
    fn test_rewrite_state_done_flag_wins_over_token() {
        let state = RewriteState::NotStarted.advance(&progress(100, Some("stale"), true));
        assert!(state.is_done());
    }

    #[test]
    fn test_requester_pays_flag() {
        let blob = GSBlob::new("b", "k", None, None);
        assert!(!blob.requires_billing());
        let billed = blob.with_billing_project(Some("proj".into()));
        assert!(billed.requires_billing());
        assert_eq!(billed.url(), "gs://b/k");
    }

    #[test]
    fn test_store_blob_is_deterministic() {
        let store = GSBlobStore::new("bucket").with_billing_project(Some("p".into()));
        let a = store.blob("x/y");
        let b = store.blob("x/y");
        assert_eq!(a.url(), b.url());
        assert_eq!(a.descriptor(), b.descriptor());
    }
}
