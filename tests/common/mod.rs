// tests/common/mod.rs
//
// Shared fixtures: in-memory GCS and Azure services and payload helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tnu::azure_client::{AzureApi, AzureBlobProperties, BlobListPage};
use tnu::checksum::{Checksum, ChecksumAlgorithm};
use tnu::gcs_client::{GcsApi, GcsObjectMetadata, ListPage, ObjectPath, RewriteProgress};
use tnu::{AzureBlob, AzureBlobStore, BlobStoreError, GSBlob, Result};

/// Deterministic, non-repeating-looking payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// In-memory `GcsApi`.
///
/// Every call is appended to `calls` as `"<op> <url>"` so tests can assert on
/// dispatch order.
#[derive(Default)]
pub struct FakeGcs {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    calls: Mutex<Vec<String>>,
    /// Number of intermediate responses before a rewrite reports done
    pub rewrite_steps: AtomicUsize,
    /// Flip the first byte of everything written, as a flaky network would
    pub corrupt_writes: AtomicBool,
    /// Report objects without a crc32c
    pub hide_crc32c: AtomicBool,
    /// Fail every compose call
    pub fail_compose: AtomicBool,
    pub list_page_size: AtomicUsize,
}

impl FakeGcs {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.list_page_size.store(2, Ordering::SeqCst);
        Arc::new(fake)
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(&(bucket.to_string(), key.to_string())).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{} ", op);
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Blob bound to this fake.
    pub fn blob(self: &Arc<Self>, bucket: &str, key: &str) -> GSBlob {
        GSBlob::new(bucket, key, None, None).with_api(self.clone() as Arc<dyn GcsApi>)
    }

    fn log(&self, op: &str, path: &ObjectPath) {
        self.calls.lock().unwrap().push(format!("{} {}", op, path.url()));
    }

    fn metadata(&self, name: &str, data: &[u8]) -> GcsObjectMetadata {
        let crc32c = (!self.hide_crc32c.load(Ordering::SeqCst))
            .then(|| Checksum::of(ChecksumAlgorithm::Crc32c, data).value);
        GcsObjectMetadata {
            name: name.to_string(),
            size: data.len() as u64,
            crc32c,
            md5_hash: Some(Checksum::of(ChecksumAlgorithm::Md5, data).value),
            etag: None,
        }
    }

    fn read(&self, path: &ObjectPath) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&(path.bucket.clone(), path.object.clone()))
            .cloned()
            .ok_or_else(|| BlobStoreError::not_found(path.url()))
    }

    fn write(&self, path: &ObjectPath, data: Bytes) -> GcsObjectMetadata {
        let data = if self.corrupt_writes.load(Ordering::SeqCst) && !data.is_empty() {
            let mut bytes = data.to_vec();
            bytes[0] ^= 0xff;
            Bytes::from(bytes)
        } else {
            data
        };
        let meta = self.metadata(&path.object, &data);
        self.objects
            .lock()
            .unwrap()
            .insert((path.bucket.clone(), path.object.clone()), data);
        meta
    }
}

#[async_trait]
impl GcsApi for FakeGcs {
    async fn stat(&self, path: &ObjectPath) -> Result<GcsObjectMetadata> {
        self.log("stat", path);
        let data = self.read(path)?;
        Ok(self.metadata(&path.object, &data))
    }

    async fn download(&self, path: &ObjectPath, range: Option<(u64, u64)>) -> Result<Bytes> {
        self.log("download", path);
        let data = self.read(path)?;
        Ok(match range {
            None => data,
            Some((first, last)) => {
                let end = (last as usize + 1).min(data.len());
                data.slice((first as usize).min(end)..end)
            }
        })
    }

    async fn upload(&self, path: &ObjectPath, data: Bytes) -> Result<GcsObjectMetadata> {
        self.log("upload", path);
        Ok(self.write(path, data))
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        self.log("delete", path);
        self.objects
            .lock()
            .unwrap()
            .remove(&(path.bucket.clone(), path.object.clone()))
            .map(|_| ())
            .ok_or_else(|| BlobStoreError::not_found(path.url()))
    }

    async fn list_page(&self, bucket: &str, prefix: Option<&str>, page_token: Option<String>) -> Result<ListPage> {
        self.calls.lock().unwrap().push(format!("list gs://{}/{}", bucket, prefix.unwrap_or("")));
        let page_size = self.list_page_size.load(Ordering::SeqCst).max(1);
        let start: usize = page_token.as_deref().map(|t| t.parse().unwrap()).unwrap_or(0);
        let matching: Vec<(String, Bytes)> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix.unwrap_or("")))
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect();
        let end = (start + page_size).min(matching.len());
        Ok(ListPage {
            objects: matching[start..end].iter().map(|(k, v)| self.metadata(k, v)).collect(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn rewrite(&self, src: &ObjectPath, dst: &ObjectPath, rewrite_token: Option<String>) -> Result<RewriteProgress> {
        self.calls.lock().unwrap().push(format!("rewrite {} -> {}", src.url(), dst.url()));
        let data = self.read(src)?;
        let size = data.len() as u64;
        let steps = self.rewrite_steps.load(Ordering::SeqCst) as u64;
        let step: u64 = rewrite_token.as_deref().map(|t| t.parse().unwrap()).unwrap_or(0) + 1;
        if step <= steps {
            return Ok(RewriteProgress {
                total_bytes_rewritten: size * step / (steps + 1),
                object_size: size,
                done: false,
                rewrite_token: Some(step.to_string()),
            });
        }
        self.write(dst, data);
        Ok(RewriteProgress {
            total_bytes_rewritten: size,
            object_size: size,
            done: true,
            rewrite_token: None,
        })
    }

    async fn compose(&self, dst: &ObjectPath, sources: &[String]) -> Result<GcsObjectMetadata> {
        self.log("compose", dst);
        if self.fail_compose.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Backend(anyhow::anyhow!("compose rejected")));
        }
        if sources.len() > 32 {
            return Err(BlobStoreError::Backend(anyhow::anyhow!("too many compose sources: {}", sources.len())));
        }
        let mut joined = Vec::new();
        for name in sources {
            joined.extend_from_slice(&self.read(&dst.sibling(name.clone()))?);
        }
        // compose concatenates stored bytes as-is
        let joined = Bytes::from(joined);
        let meta = self.metadata(&dst.object, &joined);
        self.objects
            .lock()
            .unwrap()
            .insert((dst.bucket.clone(), dst.object.clone()), joined);
        Ok(meta)
    }
}

/// Account name every `FakeAzure` blob lives in.
pub const FAKE_AZURE_ACCOUNT: &str = "acct";

/// In-memory `AzureApi` with block blob semantics.
///
/// Staged blocks are checked against their transactional md5, and a committed
/// block list stores the Content-MD5 it was given, as the service does.
#[derive(Default)]
pub struct FakeAzure {
    // (container, blob) -> (data, stored Content-MD5)
    blobs: Mutex<BTreeMap<(String, String), (Bytes, Option<String>)>>,
    // (container, blob, block id) -> staged data
    blocks: Mutex<BTreeMap<(String, String, String), Bytes>>,
    calls: Mutex<Vec<String>>,
    /// Flip the first byte of every staged block, after its md5 was computed
    pub corrupt_blocks: AtomicBool,
    pub list_page_size: AtomicUsize,
}

impl FakeAzure {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.list_page_size.store(2, Ordering::SeqCst);
        Arc::new(fake)
    }

    fn url(container: &str, blob: &str) -> String {
        format!("az://{}/{}/{}", FAKE_AZURE_ACCOUNT, container, blob)
    }

    fn log(&self, op: &str, container: &str, blob: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", op, Self::url(container, blob)));
    }

    pub fn insert(&self, container: &str, blob: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let md5 = Checksum::of(ChecksumAlgorithm::Md5, &data).value;
        self.blobs
            .lock()
            .unwrap()
            .insert((container.to_string(), blob.to_string()), (data, Some(md5)));
    }

    /// Overwrite the stored Content-MD5 of an existing blob.
    pub fn set_content_md5(&self, container: &str, blob: &str, md5: Option<String>) {
        if let Some(entry) = self.blobs.lock().unwrap().get_mut(&(container.to_string(), blob.to_string())) {
            entry.1 = md5;
        }
    }

    pub fn object(&self, container: &str, blob: &str) -> Option<Bytes> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(container.to_string(), blob.to_string()))
            .map(|(data, _)| data.clone())
    }

    pub fn staged_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn calls_of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{} ", op);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn blob(self: &Arc<Self>, container: &str, key: &str) -> AzureBlob {
        AzureBlob::new(FAKE_AZURE_ACCOUNT, container, key).with_api(self.clone() as Arc<dyn AzureApi>)
    }

    pub fn store(self: &Arc<Self>, container: &str) -> AzureBlobStore {
        AzureBlobStore::new(FAKE_AZURE_ACCOUNT, container).with_api(self.clone() as Arc<dyn AzureApi>)
    }

    fn read(&self, container: &str, blob: &str) -> Result<(Bytes, Option<String>)> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(container.to_string(), blob.to_string()))
            .cloned()
            .ok_or_else(|| BlobStoreError::not_found(Self::url(container, blob)))
    }
}

#[async_trait]
impl AzureApi for FakeAzure {
    async fn stat(&self, container: &str, blob: &str) -> Result<AzureBlobProperties> {
        self.log("stat", container, blob);
        let (data, content_md5) = self.read(container, blob)?;
        Ok(AzureBlobProperties {
            content_length: data.len() as u64,
            content_md5,
            etag: None,
        })
    }

    async fn download(&self, container: &str, blob: &str, range: Option<(u64, u64)>) -> Result<Bytes> {
        self.log("download", container, blob);
        let (data, _) = self.read(container, blob)?;
        Ok(match range {
            None => data,
            Some((first, last)) => {
                let end = (last as usize + 1).min(data.len());
                data.slice((first as usize).min(end)..end)
            }
        })
    }

    async fn upload(&self, container: &str, blob: &str, data: Bytes) -> Result<()> {
        self.log("upload", container, blob);
        self.insert(container, blob, data);
        Ok(())
    }

    async fn delete(&self, container: &str, blob: &str) -> Result<()> {
        self.log("delete", container, blob);
        self.blobs
            .lock()
            .unwrap()
            .remove(&(container.to_string(), blob.to_string()))
            .map(|_| ())
            .ok_or_else(|| BlobStoreError::not_found(Self::url(container, blob)))
    }

    async fn list_page(&self, container: &str, prefix: Option<&str>, marker: Option<String>) -> Result<BlobListPage> {
        self.log("list", container, prefix.unwrap_or(""));
        let page_size = self.list_page_size.load(Ordering::SeqCst).max(1);
        let start: usize = marker.as_deref().map(|m| m.parse().unwrap()).unwrap_or(0);
        let names: Vec<String> = self
            .blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, b)| c == container && b.starts_with(prefix.unwrap_or("")))
            .map(|(_, b)| b.clone())
            .collect();
        let end = (start + page_size).min(names.len());
        Ok(BlobListPage {
            names: names[start..end].to_vec(),
            next_marker: (end < names.len()).then(|| end.to_string()),
        })
    }

    async fn stage_block(&self, container: &str, blob: &str, block_id: &str, data: Bytes, md5: [u8; 16]) -> Result<()> {
        self.log("put_block", container, blob);
        let data = if self.corrupt_blocks.load(Ordering::SeqCst) && !data.is_empty() {
            let mut bytes = data.to_vec();
            bytes[0] ^= 0xff;
            Bytes::from(bytes)
        } else {
            data
        };
        if md5::compute(&data).0 != md5 {
            return Err(BlobStoreError::Backend(anyhow::anyhow!(
                "Md5Mismatch: block {} of {}",
                block_id,
                Self::url(container, blob)
            )));
        }
        self.blocks
            .lock()
            .unwrap()
            .insert((container.to_string(), blob.to_string(), block_id.to_string()), data);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        content_md5: [u8; 16],
    ) -> Result<()> {
        self.log("put_block_list", container, blob);
        let mut blocks = self.blocks.lock().unwrap();
        let mut joined = Vec::new();
        for id in block_ids {
            let key = (container.to_string(), blob.to_string(), id.clone());
            let data = blocks.get(&key).ok_or_else(|| {
                BlobStoreError::Backend(anyhow::anyhow!("InvalidBlockList: {} was never staged", id))
            })?;
            joined.extend_from_slice(data);
        }
        blocks.retain(|(c, b, _), _| !(c == container && b == blob));
        self.blobs.lock().unwrap().insert(
            (container.to_string(), blob.to_string()),
            (Bytes::from(joined), Some(BASE64.encode(content_md5))),
        );
        Ok(())
    }
}
