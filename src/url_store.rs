// src/url_store.rs
//
// Read-only HTTP(S) blob backend.
//
// Size and checksums come from a HEAD request; content is read with ranged
// GETs through the same ordered prefetch used by the cloud backends. Any
// HTTP error status or connection failure surfaces as `NotFound`: an
// unreachable URL is indistinguishable from a missing object to the caller.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::blob::{Blob, BlobDescriptor, PartWriter, download_parts, preferred_checksum, warn_unverified};
use crate::checksum::Checksum;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_IO_CONCURRENCY};
use crate::error::{BlobStoreError, Result};
use crate::part::{Part, PartStream, ProgressStream, ranged_parts};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a HEAD request tells us about the object.
#[derive(Debug, Clone, Default)]
pub struct UrlObjectInfo {
    pub size: Option<u64>,
    /// Every checksum the server advertised, in header order.
    pub checksums: Vec<Checksum>,
}

#[derive(Clone)]
pub struct URLBlob {
    url: String,
    checksum: Option<Checksum>,
    chunk_size: usize,
    io_concurrency: usize,
    client: Arc<OnceCell<Client>>,
}

impl std::fmt::Debug for URLBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("URLBlob")
            .field("url", &self.url)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl URLBlob {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            checksum: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            client: Arc::new(OnceCell::new()),
        }
    }

    /// Checksum known out of band (e.g. from a DRS resolution). It is
    /// considered alongside whatever the server advertises.
    pub fn with_checksum(mut self, checksum: Option<Checksum>) -> Self {
        self.checksum = checksum;
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

    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::Url {
            url: self.url.clone(),
            checksum: self.checksum.clone(),
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("failed to build HTTP client: {}", e)))
            })
            .await?;
        Ok(client.clone())
    }

    /// HEAD the object: size and advertised checksums.
    pub async fn info(&self) -> Result<UrlObjectInfo> {
        let client = self.client().await?;
        debug!("HTTP HEAD: {}", self.url);
        let response = client.head(&self.url).send().await.map_err(|e| self.unreachable(e))?;
        check_status(&self.url, response.status())?;
        let headers = response.headers();
        let mut checksums: Vec<Checksum> = self.checksum.iter().cloned().collect();
        checksums.extend(checksums_from_headers(headers));
        Ok(UrlObjectInfo {
            // HEAD has no body, so read the header rather than the body size hint
            size: headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
            checksums,
        })
    }

    fn unreachable(&self, err: reqwest::Error) -> BlobStoreError {
        debug!("HTTP request to {} failed: {}", self.url, err);
        BlobStoreError::not_found(&self.url)
    }

    async fn known_size(&self) -> Result<Option<u64>> {
        Ok(self.info().await?.size)
    }

    /// Unknown length: stream the body and re-cut it into `chunk_size` parts.
    async fn streamed_parts(&self) -> Result<PartStream> {
        let client = self.client().await?;
        let response = client.get(&self.url).send().await.map_err(|e| self.unreachable(e))?;
        check_status(&self.url, response.status())?;
        let chunk_size = self.chunk_size;
        let url = self.url.clone();
        Ok(Box::pin(async_stream::try_stream! {
            let mut body = response.bytes_stream();
            let mut buffer = BytesMut::new();
            let mut number = 0usize;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| BlobStoreError::Backend(anyhow::anyhow!("read from {} failed: {}", url, e)))?;
                buffer.extend_from_slice(&chunk);
                while buffer.len() >= chunk_size {
                    yield Part::new(number, buffer.split_to(chunk_size).freeze());
                    number += 1;
                }
            }
            if !buffer.is_empty() || number == 0 {
                yield Part::new(number, buffer.freeze());
            }
        }))
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        debug!("HTTP {} for {}", status, url);
        Err(BlobStoreError::not_found(url))
    }
}

/// Collect checksums from `x-goog-hash` (crc32c, md5), `Content-MD5` and `ETag`.
pub fn checksums_from_headers(headers: &HeaderMap) -> Vec<Checksum> {
    let mut found = Vec::new();
    for value in headers.get_all("x-goog-hash") {
        let Ok(value) = value.to_str() else { continue };
        for entry in value.split(',') {
            match entry.trim().split_once('=') {
                Some(("crc32c", v)) => found.push(Checksum::crc32c(v)),
                Some(("md5", v)) => found.push(Checksum::md5(v)),
                _ => {}
            }
        }
    }
    if let Some(v) = headers.get("content-md5").and_then(|v| v.to_str().ok()) {
        found.push(Checksum::md5(v.trim()));
    }
    if let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok()).and_then(Checksum::from_etag) {
        found.push(etag);
    }
    found
}

#[async_trait]
impl Blob for URLBlob {
    fn key(&self) -> &str {
        &self.url
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    async fn exists(&self) -> Result<bool> {
        match self.info().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self) -> Result<u64> {
        match self.known_size().await? {
            Some(size) => Ok(size),
            None => Ok(self.get().await?.len() as u64),
        }
    }

    async fn get(&self) -> Result<Bytes> {
        let client = self.client().await?;
        debug!("HTTP GET: {}", self.url);
        let response = client.get(&self.url).send().await.map_err(|e| self.unreachable(e))?;
        check_status(&self.url, response.status())?;
        response.bytes().await.map_err(|e| self.unreachable(e))
    }

    async fn put(&self, _data: Bytes) -> Result<()> {
        Err(BlobStoreError::UnsupportedOperation(format!("{} is read-only", self.url)))
    }

    async fn delete(&self) -> Result<()> {
        Err(BlobStoreError::UnsupportedOperation(format!("{} is read-only", self.url)))
    }

    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>> {
        Ok(preferred_checksum(&self.info().await?.checksums))
    }

    async fn iter_content(&self) -> Result<PartStream> {
        let Some(size) = self.known_size().await? else {
            return self.streamed_parts().await;
        };
        let client = self.client().await?;
        let url = self.url.clone();
        Ok(ranged_parts(self.url.clone(), size, self.chunk_size, self.io_concurrency, move |offset, length| {
            let client = client.clone();
            let url = url.clone();
            async move {
                let last = offset + length - 1;
                let response = client
                    .get(&url)
                    .header(RANGE, format!("bytes={}-{}", offset, last))
                    .send()
                    .await
                    .map_err(|_| BlobStoreError::not_found(&url))?;
                let status = response.status();
                check_status(&url, status)?;
                let body = response.bytes().await.map_err(|_| BlobStoreError::not_found(&url))?;
                if status == StatusCode::PARTIAL_CONTENT {
                    Ok(body)
                } else {
                    // Server ignored the range and sent the whole object
                    let end = (last + 1).min(body.len() as u64) as usize;
                    Ok(body.slice((offset as usize).min(end)..end))
                }
            }
        }))
    }

    async fn download_iter(&self, path: &Path) -> Result<ProgressStream> {
        let info = self.info().await?;
        let expected = preferred_checksum(&info.checksums);
        match &expected {
            Some(c) => debug!("verifying download of {} with {}", self.url, c.algorithm),
            None => warn_unverified(&self.url),
        }
        let parts = self.iter_content().await?;
        Ok(download_parts(self.url.clone(), parts, path.to_path_buf(), expected))
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>> {
        Err(BlobStoreError::UnsupportedOperation(format!("{} is read-only", self.url)))
    }
}
