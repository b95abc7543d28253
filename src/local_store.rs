// src/local_store.rs
//
// Local filesystem backend.
//
// URL Mapping:
// - the blob url is the absolute path of the file
// - `LocalBlobStore::blob(key)` resolves `key` relative to the store root
//
// Local files carry no native checksum; downloads into local paths are
// plain chunked copies.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::blob::{Blob, BlobDescriptor, BlobStore, PartWriter};
use crate::checksum::Checksum;
use crate::constants::DEFAULT_CHUNK_SIZE;
use crate::error::{BlobStoreError, Result, io_error};
use crate::part::{Part, PartStream, ProgressStream};

#[derive(Debug, Clone)]
pub struct LocalBlob {
    key: String,
    path: PathBuf,
    chunk_size: usize,
}

impl LocalBlob {
    /// Blob addressed by a full filesystem path; the key is the path itself.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            key: path.display().to_string(),
            path,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor::Local { path: self.path.clone() }
    }

    fn url_str(&self) -> String {
        self.path.display().to_string()
    }

    /// True when both blobs name the same file, following symlinks when possible.
    async fn same_file(&self, other: &Path) -> bool {
        if self.path == other {
            return true;
        }
        match (fs::canonicalize(&self.path).await, fs::canonicalize(other).await) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Byte-for-byte copy of `src` into this blob, yielding bytes per chunk.
    ///
    /// Copying a file onto itself is a no-op.
    pub async fn copy_from_iter(&self, src: &LocalBlob) -> Result<ProgressStream> {
        if self.same_file(&src.path).await {
            debug!("copy of {} onto itself skipped", self.url_str());
            return Ok(Box::pin(futures::stream::empty()));
        }
        let parts = src.iter_content().await?;
        Ok(write_parts(parts, self.path.clone()))
    }
}

/// Append each part to a fresh file at `path`.
fn write_parts(mut parts: PartStream, path: PathBuf) -> ProgressStream {
    use futures::StreamExt;
    Box::pin(async_stream::try_stream! {
        let url = path.display().to_string();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(e, &url))?;
        }
        let mut file = fs::File::create(&path).await.map_err(|e| io_error(e, &url))?;
        while let Some(part) = parts.next().await {
            let part = part?;
            file.write_all(&part.data).await.map_err(|e| io_error(e, &url))?;
            yield part.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(e, &url))?;
    })
}

/// Fill `buf` up to its capacity unless EOF comes first.
async fn read_chunk(file: &mut fs::File, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(chunk_size);
    while buf.len() < chunk_size {
        let mut limited = (&mut *file).take((chunk_size - buf.len()) as u64);
        let n = limited.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

#[async_trait]
impl Blob for LocalBlob {
    fn key(&self) -> &str {
        &self.key
    }

    fn url(&self) -> String {
        self.url_str()
    }

    async fn exists(&self) -> Result<bool> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e, &self.url_str())),
        }
    }

    async fn size(&self) -> Result<u64> {
        let meta = fs::metadata(&self.path).await.map_err(|e| io_error(e, &self.url_str()))?;
        if !meta.is_file() {
            return Err(BlobStoreError::not_found(self.url_str()));
        }
        Ok(meta.len())
    }

    async fn get(&self) -> Result<Bytes> {
        trace!("local GET {}", self.path.display());
        let data = fs::read(&self.path).await.map_err(|e| io_error(e, &self.url_str()))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, data: Bytes) -> Result<()> {
        trace!("local PUT {} ({} bytes)", self.path.display(), data.len());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(e, &self.url_str()))?;
        }
        fs::write(&self.path, &data).await.map_err(|e| io_error(e, &self.url_str()))
    }

    async fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path).await.map_err(|e| io_error(e, &self.url_str()))
    }

    async fn cloud_native_checksum(&self) -> Result<Option<Checksum>> {
        // Surface NotFound consistently with the other backends
        self.size().await?;
        Ok(None)
    }

    async fn iter_content(&self) -> Result<PartStream> {
        let url = self.url_str();
        let mut file = fs::File::open(&self.path).await.map_err(|e| io_error(e, &url))?;
        let chunk_size = self.chunk_size;
        Ok(Box::pin(async_stream::try_stream! {
            let mut number = 0usize;
            loop {
                let data = read_chunk(&mut file, chunk_size).await.map_err(|e| io_error(e, &url))?;
                let last = data.len() < chunk_size;
                // An empty file still yields one empty part; otherwise a trailing
                // empty read just ends the sequence.
                if data.is_empty() && number > 0 {
                    break;
                }
                yield Part::new(number, data);
                number += 1;
                if last {
                    break;
                }
            }
        }))
    }

    async fn download_iter(&self, path: &Path) -> Result<ProgressStream> {
        let dst = LocalBlob::from_path(path.to_path_buf());
        dst.copy_from_iter(self).await
    }

    async fn part_writer(&self) -> Result<Box<dyn PartWriter>> {
        Ok(Box::new(LocalPartWriter::create(self.path.clone()).await?))
    }
}

/// Writes parts into a sibling temporary file and renames it into place on close.
pub struct LocalPartWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<fs::File>,
    next_number: usize,
    pending: BTreeMap<usize, Bytes>,
    closed: bool,
}

impl LocalPartWriter {
    async fn create(path: PathBuf) -> Result<Self> {
        let url = path.display().to_string();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(e, &url))?;
        }
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(format!(".part-{}", std::process::id()));
        let tmp_path = path.with_file_name(tmp_name);
        let file = fs::File::create(&tmp_path).await.map_err(|e| io_error(e, &url))?;
        Ok(Self {
            path,
            tmp_path,
            file: Some(file),
            next_number: 0,
            pending: BTreeMap::new(),
            closed: false,
        })
    }

    async fn flush_ready(&mut self) -> Result<()> {
        let url = self.path.display().to_string();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BlobStoreError::Backend(anyhow::anyhow!("writer for {} already closed", url)))?;
        while let Some(data) = self.pending.remove(&self.next_number) {
            file.write_all(&data).await.map_err(|e| io_error(e, &url))?;
            self.next_number += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl PartWriter for LocalPartWriter {
    async fn put_part(&mut self, part: Part) -> Result<()> {
        if part.number < self.next_number || self.pending.contains_key(&part.number) {
            return Err(BlobStoreError::Backend(anyhow::anyhow!(
                "part {} written twice to {}",
                part.number,
                self.path.display()
            )));
        }
        self.pending.insert(part.number, part.data);
        self.flush_ready().await
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let url = self.path.display().to_string();
        if let Some(missing) = self.pending.keys().next() {
            return Err(BlobStoreError::Backend(anyhow::anyhow!(
                "cannot finalize {}: part {} is missing before part {}",
                url,
                self.next_number,
                missing
            )));
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| io_error(e, &url))?;
            file.sync_all().await.map_err(|e| io_error(e, &url))?;
        }
        fs::rename(&self.tmp_path, &self.path).await.map_err(|e| io_error(e, &url))?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for LocalPartWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Store rooted at a base directory; keys are paths relative to it.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    basepath: PathBuf,
    chunk_size: usize,
}

impl LocalBlobStore {
    pub fn new(basepath: impl Into<PathBuf>) -> Self {
        Self {
            basepath: basepath.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn basepath(&self) -> &Path {
        &self.basepath
    }

    /// Recursively collect regular files under `dir`
    async fn collect_files_recursive(dir: &Path, results: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let entry_path = entry.path();
            if file_type.is_dir() {
                Box::pin(Self::collect_files_recursive(&entry_path, results)).await?;
            } else if file_type.is_file() {
                results.push(entry_path);
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    type Blob = LocalBlob;

    fn schema(&self) -> &'static str {
        ""
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn blob(&self, key: &str) -> LocalBlob {
        LocalBlob {
            key: key.to_string(),
            path: self.basepath.join(key),
            chunk_size: self.chunk_size,
        }
    }

    fn list(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Result<LocalBlob>> + Send + 'static>> {
        let store = self.clone();
        let prefix = prefix.to_string();
        Box::pin(async_stream::try_stream! {
            let mut files = Vec::new();
            Self::collect_files_recursive(&store.basepath, &mut files)
                .await
                .map_err(|e| io_error(e, &store.basepath.display().to_string()))?;
            for path in files {
                let Ok(relative) = path.strip_prefix(&store.basepath) else { continue };
                let key = relative.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    yield store.blob(&key);
                }
            }
        })
    }
}
