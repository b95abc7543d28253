// src/azure_client.rs
//
// Azure Blob Storage client seam.
//
// `AzureApi` is the set of block blob operations the Azure backend needs.
// `AzureSdkApi` implements it on the azure_storage_blobs SDK; tests plug in an
// in-memory implementation. Every method translates a 404 into
// `BlobStoreError::NotFound` so callers never see SDK error types.
//
// Authentication, per account:
// - an access key configured for the account wins (shared key signing)
// - otherwise DefaultAzureCredential (environment, workload/managed identity,
//   Azure CLI), built once per process and shared by every client

use anyhow::anyhow;
use async_trait::async_trait;
use azure_core::StatusCode;
use azure_core::auth::TokenCredential;
use azure_core::error::{Error as AzureError, ErrorKind};
use azure_core::request_options::{MaxResults, NextMarker};
use azure_storage::{CloudLocation, StorageCredentials};
use azure_storage_blobs::prelude::*;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::AzureSettings;
use crate::constants::AZURE_LIST_PAGE_SIZE;
use crate::error::{BlobStoreError, Result};

// Global credential cache to avoid repeated authentication
static AZURE_CREDENTIAL: OnceCell<Arc<dyn TokenCredential>> = OnceCell::const_new();

/// Properties surfaced by `stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzureBlobProperties {
    pub content_length: u64,
    /// Base64 md5; absent for block lists committed without one.
    pub content_md5: Option<String>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobListPage {
    pub names: Vec<String>,
    pub next_marker: Option<String>,
}

#[async_trait]
pub trait AzureApi: Send + Sync {
    async fn stat(&self, container: &str, blob: &str) -> Result<AzureBlobProperties>;

    /// Inclusive byte range `(first, last)`; `None` downloads everything.
    async fn download(&self, container: &str, blob: &str, range: Option<(u64, u64)>) -> Result<Bytes>;

    async fn upload(&self, container: &str, blob: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, container: &str, blob: &str) -> Result<()>;

    async fn list_page(&self, container: &str, prefix: Option<&str>, marker: Option<String>) -> Result<BlobListPage>;

    /// Stage one uncommitted block. `md5` is the digest of `data`, sent as the
    /// transactional Content-MD5 so the service rejects a corrupted block.
    async fn stage_block(&self, container: &str, blob: &str, block_id: &str, data: Bytes, md5: [u8; 16]) -> Result<()>;

    /// Commit staged blocks in the given order, recording `content_md5` as the
    /// blob's Content-MD5.
    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        content_md5: [u8; 16],
    ) -> Result<()>;
}

/// Fixed-width block id for part `number`; the SDK base64-encodes it on the wire.
pub fn block_id(number: usize) -> String {
    format!("{:016x}", number)
}

/// `AzureApi` on top of the azure_storage_blobs client for one account.
pub struct AzureSdkApi {
    account: String,
    service: BlobServiceClient,
}

impl std::fmt::Debug for AzureSdkApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureSdkApi").field("account", &self.account).finish_non_exhaustive()
    }
}

async fn default_credential() -> Result<Arc<dyn TokenCredential>> {
    let credential = AZURE_CREDENTIAL
        .get_or_try_init(|| async {
            debug!("Initializing DefaultAzureCredential");
            azure_identity::create_default_credential()
                .map_err(|e| BlobStoreError::Configuration(format!("no usable Azure credential: {}", e)))
        })
        .await?;
    Ok(Arc::clone(credential))
}

impl AzureSdkApi {
    /// Access key when `settings` carries one for this account, else the
    /// default credential chain.
    pub async fn connect(account: &str, settings: &AzureSettings) -> Result<Self> {
        let key_for_account = settings
            .access_key
            .as_ref()
            .filter(|_| settings.account.as_deref().is_none_or(|a| a == account));
        let credentials = match key_for_account {
            Some(key) => {
                debug!("Azure account {}: access key authentication", account);
                StorageCredentials::access_key(account.to_string(), key.trim().to_string())
            }
            None => {
                debug!("Azure account {}: default credential chain", account);
                StorageCredentials::token_credential(default_credential().await?)
            }
        };
        let builder = match &settings.endpoint {
            Some(_) => {
                let uri = settings.account_url(account);
                info!("Using custom Azure endpoint: {}", uri);
                ClientBuilder::with_location(
                    CloudLocation::Custom {
                        account: account.to_string(),
                        uri,
                    },
                    credentials,
                )
            }
            None => ClientBuilder::new(account.to_string(), credentials),
        };
        Ok(Self {
            account: account.to_string(),
            service: builder.blob_service_client(),
        })
    }

    pub async fn connect_shared(account: &str, settings: &AzureSettings) -> Result<Arc<dyn AzureApi>> {
        Ok(Arc::new(Self::connect(account, settings).await?))
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn url(&self, container: &str, blob: &str) -> String {
        format!("az://{}/{}/{}", self.account, container, blob)
    }

    fn blob_client(&self, container: &str, blob: &str) -> BlobClient {
        self.service.container_client(container.to_string()).blob_client(blob.to_string())
    }
}

fn is_not_found(err: &AzureError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::HttpResponse {
            status: StatusCode::NotFound,
            ..
        }
    )
}

/// Map an SDK error, turning 404 into `NotFound` for `url`.
fn translate(err: AzureError, op: &str, url: &str) -> BlobStoreError {
    if is_not_found(&err) {
        BlobStoreError::not_found(url)
    } else {
        BlobStoreError::Backend(anyhow!("Azure {} failed for {}: {}", op, url, err))
    }
}

#[async_trait]
impl AzureApi for AzureSdkApi {
    async fn stat(&self, container: &str, blob: &str) -> Result<AzureBlobProperties> {
        let url = self.url(container, blob);
        debug!("AZURE STAT: {}", url);
        let response = self
            .blob_client(container, blob)
            .get_properties()
            .await
            .map_err(|e| translate(e, "STAT", &url))?;
        let properties = response.blob.properties;
        Ok(AzureBlobProperties {
            content_length: properties.content_length,
            content_md5: properties.content_md5.map(|md5| BASE64.encode(md5.as_slice())),
            etag: Some(properties.etag.to_string()).filter(|e| !e.is_empty()),
        })
    }

    async fn download(&self, container: &str, blob: &str, range: Option<(u64, u64)>) -> Result<Bytes> {
        let url = self.url(container, blob);
        debug!("AZURE GET: {} range={:?}", url, range);
        let mut request = self.blob_client(container, blob).get();
        if let Some((first, last)) = range {
            request = request.range(first..last + 1);
        }
        // The SDK splits large reads into several responses
        let mut chunks = request.into_stream();
        let mut data = BytesMut::new();
        while let Some(response) = chunks.next().await {
            let response = response.map_err(|e| translate(e, "GET", &url))?;
            let body = response.data.collect().await.map_err(|e| translate(e, "GET", &url))?;
            data.extend_from_slice(&body);
        }
        Ok(data.freeze())
    }

    async fn upload(&self, container: &str, blob: &str, data: Bytes) -> Result<()> {
        let url = self.url(container, blob);
        debug!("AZURE PUT: {} ({} bytes)", url, data.len());
        let md5 = md5::compute(&data).0;
        self.blob_client(container, blob)
            .put_block_blob(data)
            .hash(Hash::MD5(md5))
            .await
            .map_err(|e| translate(e, "PUT", &url))?;
        Ok(())
    }

    async fn delete(&self, container: &str, blob: &str) -> Result<()> {
        let url = self.url(container, blob);
        debug!("AZURE DELETE: {}", url);
        self.blob_client(container, blob)
            .delete()
            .await
            .map_err(|e| translate(e, "DELETE", &url))?;
        Ok(())
    }

    async fn list_page(&self, container: &str, prefix: Option<&str>, marker: Option<String>) -> Result<BlobListPage> {
        let url = format!("az://{}/{}/", self.account, container);
        debug!("AZURE LIST page: {} prefix={:?}", url, prefix);
        let mut request = self.service.container_client(container.to_string()).list_blobs();
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            request = request.prefix(prefix.to_string());
        }
        if let Some(marker) = marker {
            request = request.marker(NextMarker::new(marker));
        }
        if let Some(page_size) = NonZeroU32::new(AZURE_LIST_PAGE_SIZE) {
            request = request.max_results(MaxResults::new(page_size));
        }
        // One service page per call; the caller carries the marker
        let Some(response) = request.into_stream().next().await else {
            return Ok(BlobListPage::default());
        };
        let response = response.map_err(|e| translate(e, "LIST", &url))?;
        Ok(BlobListPage {
            names: response.blobs.blobs().map(|b| b.name.clone()).collect(),
            next_marker: response
                .next_marker
                .map(|m| m.as_str().to_string())
                .filter(|m| !m.is_empty()),
        })
    }

    async fn stage_block(&self, container: &str, blob: &str, block_id: &str, data: Bytes, md5: [u8; 16]) -> Result<()> {
        let url = self.url(container, blob);
        debug!("AZURE PUT BLOCK: {} block={} ({} bytes)", url, block_id, data.len());
        self.blob_client(container, blob)
            .put_block(BlockId::new(block_id.to_string()), data)
            .hash(Hash::MD5(md5))
            .await
            .map_err(|e| translate(e, "PUT BLOCK", &url))?;
        Ok(())
    }

    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        content_md5: [u8; 16],
    ) -> Result<()> {
        let url = self.url(container, blob);
        debug!("AZURE PUT BLOCK LIST: {} ({} blocks)", url, block_ids.len());
        let blocks = BlockList {
            blocks: block_ids
                .iter()
                .map(|id| BlobBlockType::new_uncommitted(BlockId::new(id.clone())))
                .collect(),
        };
        self.blob_client(container, blob)
            .put_block_list(blocks)
            .content_md5(BlobContentMD5::from(content_md5))
            .await
            .map_err(|e| translate(e, "PUT BLOCK LIST", &url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ids_fixed_width() {
        assert_eq!(block_id(0).len(), block_id(123_456).len());
        assert_ne!(block_id(1), block_id(2));
        assert!(block_id(7) < block_id(10));
    }

    #[tokio::test]
    async fn test_access_key_client_needs_no_credential_chain() {
        let settings = AzureSettings {
            account: Some("devstoreaccount1".into()),
            access_key: Some("c2VjcmV0".into()),
            endpoint: Some("http://127.0.0.1:10000/devstoreaccount1".into()),
        };
        let api = AzureSdkApi::connect("devstoreaccount1", &settings).await.unwrap();
        assert_eq!(api.account(), "devstoreaccount1");
        assert_eq!(api.url("c", "k"), "az://devstoreaccount1/c/k");
    }
}
