// src/azure_store.rs
//
// Azure Blob Storage backend: `az://{account}/{container}/{key}`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::collections::BTreeMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use crate::azure_client::{AzureApi, AzureSdkApi, block_id};
use crate::blob::{Blob, BlobDescriptor, BlobStore, PartWriter, download_parts, warn_unverified};
use crate::checksum::Checksum;
use crate::config::AzureSettings;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_IO_CONCURRENCY};
use crate::error::{BlobStoreError, Result};
use crate::part::{Part, PartStream, ProgressStream, ranged_parts};

type ApiCell = Arc<OnceCell<Arc<dyn AzureApi>>>;

/// Lazily connect; settings come from the environment unless injected.
async fn connect(cell: &ApiCell, account: &str, settings: &Option<AzureSettings>) -> Result<Arc<dyn AzureApi>> {
    let client = cell
        .get_or_try_init(|| async {
            let settings = settings.clone().unwrap_or_else(AzureSettings::from_env);
            AzureSdkApi::connect_shared(account, &settings).await
        })
        .await?;
    Ok(Arc::clone(client))
}

/// Parse `az://account/container/key`.
pub fn parse_azure_uri(uri: &str) -> Result<(String, String, String)> {
    let rest = uri
        .strip_prefix("az://")
        .ok_or_else(|| BlobStoreError::Configuration(format!("expected az:// locator, got {}", uri)))?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(account), Some(container), Some(key)) if !account.is_empty() && !container.is_empty() && !key.is_empty() => {
            Ok((account.to_string(), container.to_string(), key.to_string()))
        }
        _ => Err(BlobStoreError::Configuration(format!(
            "Azure locator must look like az://account/container/key, got {}",
            uri
        ))),
    }
}

#[derive(Clone)]
pub struct AzureBlob {
    account: String,
    container: String,
    key: String,
    settings: Option<AzureSettings>,
    chunk_size: usize,
    io_concurrency: usize,
    client: ApiCell,
}

impl std::fmt::Debug for AzureBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AzureBlob({})", self.url())
    }
}

impl AzureBlob {
    pub fn new(account: impl Into<String>, container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            key: key.into(),
            settings: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            client: Arc::new(OnceCell::new()),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let (account, container, key) = parse_azure_uri(url)?;
        Ok(Self::new(account, container, key))
    }

    /// Explicit settings instead of reading the environment on first use.
    pub fn with_settings(mut self, settings: AzureSettings) -> Self {
        self.settings = Some(settings);
        self.client = Arc::new(OnceCell::new());
        self
    }

    /// Use an already connected API handle instead of connecting lazily.
    pub fn with_api(mut self, api: Arc<dyn AzureApi>) -> Self {
        self.client = Arc::new(OnceCell::new_with(Some(api)));
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

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::Azure {
            account: self.account.clone(),
            container: self.container.clone(),
            key: self.key.clone(),
        }
    }

    async fn client(&self) -> Result<Arc<dyn AzureApi>> {
        connect(&self.client, &self.account, &self.settings).await
    }
}

#[async_trait]
impl Blob for AzureBlob {
    fn key(&self) -> &str {
        &self.key
    }

    fn url(&self) -> String {
        format!("az://{}/{}/{}", self.account, self.container, self.key)
    }

    async fn exists(&self) -> Result<bool> {
        match self.client().await?.stat(&self.container, &self.key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.client().await?.stat(&self.container, &self.key).await?.content_length)
    }

    async fn get(&self) -> Result<Bytes> {
        self.client().await?.download(&self.container, &self.key, None).await
    }

    async fn put(&self, data: Bytes) -> Result<()> {
        self.client().await?.upload(&self.container, &self.key, data).await
    }

    async fn delete(&self) -> Result<()> {
        self.client().await?.delete(&self.container, &self.key).await
    }

    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>> {
        let props = self.client().await?.stat(&self.container, &self.key).await?;
        Ok(props.content_md5.map(Checksum::md5))
    }

    async fn iter_content(&self) -> Result<PartStream> {
        let client = self.client().await?;
        let size = client.stat(&self.container, &self.key).await?.content_length;
        let container = self.container.clone();
        let key = self.key.clone();
        Ok(ranged_parts(self.url(), size, self.chunk_size, self.io_concurrency, move |offset, length| {
            let client = Arc::clone(&client);
            let container = container.clone();
            let key = key.clone();
            async move { client.download(&container, &key, Some((offset, offset + length - 1))).await }
        }))
    }

    async fn download_iter(&self, path: &Path) -> Result<ProgressStream> {
        let expected = self.cloud_native_checksum().await?;
        if expected.is_none() {
            warn_unverified(&self.url());
        }
        let parts = self.iter_content().await?;
        Ok(download_parts(self.url(), parts, path.to_path_buf(), expected))
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>> {
        let client = self.client().await?;
        Ok(Box::new(AzurePartWriter::new(
            client,
            self.container.clone(),
            self.key.clone(),
            self.io_concurrency,
        )))
    }
}

/// Block blob upload: parts are staged as blocks, `close` commits them in order.
///
/// Every block carries its own md5 so the service rejects corrupted blocks.
/// The md5 of the whole object is accumulated in part order and stored as the
/// blob's Content-MD5 at commit.
/// Uncommitted blocks never become visible and are discarded by the service,
/// so an abandoned writer leaves nothing behind.
pub struct AzurePartWriter {
    client: Arc<dyn AzureApi>,
    container: String,
    key: String,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<usize>>,
    staged: BTreeMap<usize, String>,
    digest: md5::Context,
    next_number: usize,
    // Parts that arrived ahead of `next_number`, held until the digest reaches them
    ahead: BTreeMap<usize, Bytes>,
}

impl AzurePartWriter {
    pub fn new(client: Arc<dyn AzureApi>, container: String, key: String, max_in_flight: usize) -> Self {
        Self {
            client,
            container,
            key,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: JoinSet::new(),
            staged: BTreeMap::new(),
            digest: md5::Context::new(),
            next_number: 0,
            ahead: BTreeMap::new(),
        }
    }

    fn url(&self) -> String {
        format!("az://{}/{}", self.container, self.key)
    }

    fn record(&mut self, joined: std::result::Result<Result<usize>, tokio::task::JoinError>) -> Result<()> {
        let number = joined.map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("block upload task failed: {}", e)))??;
        self.staged.insert(number, block_id(number));
        Ok(())
    }

    fn digest_in_order(&mut self, number: usize, data: Bytes) {
        self.ahead.insert(number, data);
        while let Some(data) = self.ahead.remove(&self.next_number) {
            self.digest.consume(&data);
            self.next_number += 1;
        }
    }
}

#[async_trait]
impl PartWriter for AzurePartWriter {
    async fn put_part(&mut self, part: Part) -> Result<()> {
        if part.number < self.next_number || self.ahead.contains_key(&part.number) {
            return Err(BlobStoreError::Backend(anyhow::anyhow!(
                "part {} written twice to {}",
                part.number,
                self.url()
            )));
        }
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined)?;
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("block upload semaphore closed: {}", e)))?;
        let block_md5 = md5::compute(&part.data).0;
        self.digest_in_order(part.number, part.data.clone());
        let client = Arc::clone(&self.client);
        let container = self.container.clone();
        let key = self.key.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            client
                .stage_block(&container, &key, &block_id(part.number), part.data, block_md5)
                .await?;
            Ok(part.number)
        });
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined)?;
        }
        if self.staged.is_empty() {
            return self.client.upload(&self.container, &self.key, Bytes::new()).await;
        }
        if let Some(missing) = self.ahead.keys().next() {
            return Err(BlobStoreError::Backend(anyhow::anyhow!(
                "cannot commit {}: block {} is missing before block {}",
                self.url(),
                self.next_number,
                missing
            )));
        }
        let ids: Vec<String> = self.staged.values().cloned().collect();
        let content_md5 = std::mem::replace(&mut self.digest, md5::Context::new()).compute().0;
        self.client
            .commit_block_list(&self.container, &self.key, &ids, content_md5)
            .await?;
        debug!("committed {} blocks to {}", ids.len(), self.url());
        Ok(())
    }
}

/// One container in one account.
#[derive(Clone)]
pub struct AzureBlobStore {
    account: String,
    container: String,
    settings: Option<AzureSettings>,
    chunk_size: usize,
    io_concurrency: usize,
    client: ApiCell,
}

impl AzureBlobStore {
    pub fn new(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            settings: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            client: Arc::new(OnceCell::new()),
        }
    }

    pub fn with_settings(mut self, settings: AzureSettings) -> Self {
        self.settings = Some(settings);
        self.client = Arc::new(OnceCell::new());
        self
    }

    pub fn with_api(mut self, api: Arc<dyn AzureApi>) -> Self {
        self.client = Arc::new(OnceCell::new_with(Some(api)));
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
}

impl BlobStore for AzureBlobStore {
    type Blob = AzureBlob;

    fn schema(&self) -> &'static str {
        "az://"
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn blob(&self, key: &str) -> AzureBlob {
        AzureBlob {
            account: self.account.clone(),
            container: self.container.clone(),
            key: key.to_string(),
            settings: self.settings.clone(),
            chunk_size: self.chunk_size,
            io_concurrency: self.io_concurrency,
            client: Arc::clone(&self.client),
        }
    }

    fn list(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Result<AzureBlob>> + Send + 'static>> {
        let store = self.clone();
        let prefix = prefix.to_string();
        Box::pin(async_stream::try_stream! {
            let client = connect(&store.client, &store.account, &store.settings).await?;
            let mut marker: Option<String> = None;
            loop {
                let page = client.list_page(&store.container, Some(&prefix), marker.take()).await?;
                for name in page.names {
                    yield store.blob(&name);
                }
                match page.next_marker {
                    Some(m) => marker = Some(m),
                    None => break,
                }
            }
        })
    }
}
