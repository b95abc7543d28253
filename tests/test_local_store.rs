// tests/test_local_store.rs
//
// Integration tests for the local filesystem backend through the public
// `Blob` / `BlobStore` API.

mod common;

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use tempfile::TempDir;

use common::payload;
use tnu::{AnyBlob, Blob, BlobKind, BlobStore, BlobStoreError, LocalBlob, LocalBlobStore, blob_for_url};

#[tokio::test]
async fn test_put_get_roundtrip_sizes() -> Result<()> {
    let dir = TempDir::new()?;
    let store = LocalBlobStore::new(dir.path()).with_chunk_size(7);
    for len in [0usize, 1, 7, 50] {
        let blob = store.blob(&format!("sizes/{}.bin", len));
        let data = payload(len);
        blob.put(Bytes::from(data.clone())).await?;
        assert!(blob.exists().await?);
        assert_eq!(blob.size().await?, len as u64);
        assert_eq!(blob.get().await?.as_ref(), data.as_slice());

        let parts: Vec<_> = blob.iter_content().await?.collect().await;
        let joined: Vec<u8> = parts.into_iter().flat_map(|p| p.unwrap().data.to_vec()).collect();
        assert_eq!(joined, data);
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_blob_is_not_found_everywhere() -> Result<()> {
    let dir = TempDir::new()?;
    let blob = LocalBlobStore::new(dir.path()).blob("nope");
    assert!(!blob.exists().await?);
    assert!(blob.size().await.unwrap_err().is_not_found());
    assert!(blob.get().await.unwrap_err().is_not_found());
    assert!(blob.delete().await.unwrap_err().is_not_found());
    assert!(blob.cloud_native_checksum().await.unwrap_err().is_not_found());
    assert!(matches!(blob.iter_content().await, Err(BlobStoreError::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_download_creates_parent_dirs() -> Result<()> {
    let dir = TempDir::new()?;
    let src = LocalBlobStore::new(dir.path()).with_chunk_size(3).blob("src.txt");
    src.put(Bytes::from_static(b"hello world")).await?;

    let target = dir.path().join("a/b/c/out.txt");
    let progress: Vec<u64> = src.download_iter(&target).await?.map(|p| p.unwrap()).collect().await;
    assert_eq!(progress.iter().sum::<u64>(), 11);
    assert_eq!(std::fs::read(&target)?, b"hello world");
    Ok(())
}

#[tokio::test]
async fn test_download_onto_itself_keeps_content() -> Result<()> {
    let dir = TempDir::new()?;
    let blob = LocalBlobStore::new(dir.path()).blob("same.txt");
    blob.put(Bytes::from_static(b"unchanged")).await?;
    blob.download(&dir.path().join("same.txt")).await?;
    assert_eq!(blob.get().await?.as_ref(), b"unchanged");
    Ok(())
}

#[tokio::test]
async fn test_list_recursive_with_prefix() -> Result<()> {
    let dir = TempDir::new()?;
    let store = LocalBlobStore::new(dir.path());
    for key in ["reads/a.bam", "reads/sub/b.bam", "refs/hg38.fa"] {
        store.blob(key).put(Bytes::from_static(b"x")).await?;
    }
    let mut keys: Vec<String> = store
        .list("reads/")
        .map(|b| b.unwrap().key().to_string())
        .collect()
        .await;
    keys.sort();
    assert_eq!(keys, vec!["reads/a.bam", "reads/sub/b.bam"]);

    let all: Vec<_> = store.list("").collect().await;
    assert_eq!(all.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_list_missing_root_is_empty() -> Result<()> {
    let dir = TempDir::new()?;
    let store = LocalBlobStore::new(dir.path().join("absent"));
    assert_eq!(store.list("").count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_store_blob_is_deterministic() -> Result<()> {
    let dir = TempDir::new()?;
    let store = LocalBlobStore::new(dir.path());
    assert_eq!(store.blob("k/v").url(), store.blob("k/v").url());
    assert_eq!(store.blob("k/v").path(), dir.path().join("k/v"));
    Ok(())
}

#[tokio::test]
async fn test_descriptor_roundtrip_keeps_path() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("file.vcf");
    let blob = AnyBlob::Local(LocalBlob::from_path(&path));
    let json = serde_json::to_string(&blob.descriptor())?;
    let rebuilt = AnyBlob::from_descriptor(serde_json::from_str(&json)?);
    assert_eq!(rebuilt.kind(), BlobKind::Local);
    assert_eq!(rebuilt.url(), path.display().to_string());
    Ok(())
}

#[tokio::test]
async fn test_relative_locator_becomes_absolute() -> Result<()> {
    let blob = blob_for_url("some/relative/file.txt")?;
    assert_eq!(blob.kind(), BlobKind::Local);
    assert!(std::path::Path::new(&blob.url()).is_absolute());
    Ok(())
}
