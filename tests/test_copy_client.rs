// tests/test_copy_client.rs
//
// Copy engine: strategy choice, verification, cleanup and the worker pool.

mod common;

use anyhow::Result;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

use common::{FakeGcs, payload};
use tnu::{
    AnyBlob, Blob, BlobStoreError, CopyClient, CopyStrategy, IndicatorKind, LocalBlob, TransferConfig, copy_url,
    do_copy, plan_copy,
};

fn config() -> TransferConfig {
    TransferConfig::default()
        .with_indicator(IndicatorKind::Silent)
        .with_chunk_size(256)
        .with_multipart_threshold(1024)
}

#[tokio::test]
async fn test_gs_to_gs_uses_rewrite() -> Result<()> {
    let fake = FakeGcs::new();
    fake.rewrite_steps.store(2, Ordering::SeqCst);
    fake.insert("src", "a.bam", payload(2000));
    let src = AnyBlob::Gs(fake.blob("src", "a.bam"));
    let dst = AnyBlob::Gs(fake.blob("dst", "a.bam"));

    assert_eq!(do_copy(&src, &dst, &config()).await?, CopyStrategy::IntraCloud);
    assert_eq!(fake.object("dst", "a.bam").unwrap().as_ref(), payload(2000).as_slice());
    assert_eq!(fake.calls_of("rewrite").len(), 3);
    assert!(fake.calls_of("upload").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_requester_pays_source_is_copied_client_side() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "small", payload(500));
    fake.insert("src", "large", payload(3000));
    let billed = |key: &str| AnyBlob::Gs(fake.blob("src", key).with_billing_project(Some("proj".into())));

    let dst = AnyBlob::Gs(fake.blob("dst", "small"));
    assert_eq!(plan_copy(&billed("small"), &dst, 1024).await?, CopyStrategy::Oneshot);
    assert_eq!(do_copy(&billed("small"), &dst, &config()).await?, CopyStrategy::Oneshot);
    assert_eq!(fake.object("dst", "small").unwrap().as_ref(), payload(500).as_slice());

    let dst = AnyBlob::Gs(fake.blob("dst", "large"));
    let src = billed("large").configured(&config());
    assert_eq!(do_copy(&src, &dst, &config()).await?, CopyStrategy::Multipart);
    assert_eq!(fake.object("dst", "large").unwrap().as_ref(), payload(3000).as_slice());
    assert!(!fake.calls_of("compose").is_empty());
    assert!(fake.calls_of("rewrite").is_empty());
    assert_eq!(fake.keys("dst"), vec!["large".to_string(), "small".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_cloud_to_local_downloads() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "reads.cram", payload(1500));
    let dir = TempDir::new()?;
    let target = dir.path().join("out/reads.cram");
    let src = AnyBlob::Gs(fake.blob("src", "reads.cram"));
    let dst = AnyBlob::Local(LocalBlob::from_path(&target));

    assert_eq!(do_copy(&src, &dst, &config()).await?, CopyStrategy::Download);
    assert_eq!(std::fs::read(&target)?, payload(1500));
    Ok(())
}

#[tokio::test]
async fn test_local_to_cloud_is_unsupported() -> Result<()> {
    let fake = FakeGcs::new();
    let dir = TempDir::new()?;
    let path = dir.path().join("local.txt");
    std::fs::write(&path, b"data")?;
    let src = AnyBlob::Local(LocalBlob::from_path(&path));
    let dst = AnyBlob::Gs(fake.blob("dst", "local.txt"));

    let err = do_copy(&src, &dst, &config()).await.unwrap_err();
    assert!(matches!(err, BlobStoreError::UnsupportedOperation(_)));
    assert!(fake.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_corrupted_rewrite_is_detected_and_destination_removed() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "k", payload(800));
    fake.corrupt_writes.store(true, Ordering::SeqCst);
    let src = AnyBlob::Gs(fake.blob("src", "k"));
    let dst = AnyBlob::Gs(fake.blob("dst", "k"));

    let err = do_copy(&src, &dst, &config()).await.unwrap_err();
    assert!(matches!(err, BlobStoreError::ChecksumMismatch { .. }));
    assert!(fake.object("dst", "k").is_none());
    assert_eq!(fake.calls_of("delete"), vec!["gs://dst/k".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_corrupted_multipart_is_detected_and_destination_removed() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "big", payload(4000));
    fake.corrupt_writes.store(true, Ordering::SeqCst);
    let src = AnyBlob::Gs(fake.blob("src", "big").with_billing_project(Some("proj".into()))).configured(&config());
    let dst = AnyBlob::Gs(fake.blob("dst", "big"));

    let err = do_copy(&src, &dst, &config()).await.unwrap_err();
    assert!(matches!(err, BlobStoreError::ChecksumMismatch { .. }));
    assert!(fake.keys("dst").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_source_leaves_no_destination() -> Result<()> {
    let fake = FakeGcs::new();
    let src = AnyBlob::Gs(fake.blob("src", "missing").with_billing_project(Some("proj".into())));
    let dst = AnyBlob::Gs(fake.blob("dst", "missing"));
    assert!(do_copy(&src, &dst, &config()).await.unwrap_err().is_not_found());
    assert!(fake.keys("dst").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_copy_url_local_to_local() -> Result<()> {
    let dir = TempDir::new()?;
    let src = dir.path().join("a.txt");
    let dst = dir.path().join("copies/b.txt");
    std::fs::write(&src, b"variant calls")?;
    let strategy = copy_url(&src.display().to_string(), &dst.display().to_string(), &config()).await?;
    assert_eq!(strategy, CopyStrategy::Download);
    assert_eq!(std::fs::read(&dst)?, b"variant calls");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_largest_source_runs_first() -> Result<()> {
    let fake = FakeGcs::new();
    for (key, len) in [("ten", 10), ("thousand", 1000), ("hundred", 100)] {
        fake.insert("src", key, payload(len));
    }
    let mut client = CopyClient::new(config().with_concurrency(1));
    for key in ["ten", "thousand", "hundred"] {
        client
            .copy(AnyBlob::Gs(fake.blob("src", key)), AnyBlob::Gs(fake.blob("dst", key)))
            .await;
    }
    let report = client.finish().await?;
    assert_eq!(report.succeeded, 3);
    assert!(report.is_success());
    assert_eq!(
        fake.calls_of("rewrite"),
        vec![
            "gs://src/thousand -> gs://dst/thousand".to_string(),
            "gs://src/hundred -> gs://dst/hundred".to_string(),
            "gs://src/ten -> gs://dst/ten".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_started_client_runs_jobs_queued_later() -> Result<()> {
    let fake = FakeGcs::new();
    for key in ["x", "y"] {
        fake.insert("src", key, payload(10));
    }
    let mut client = CopyClient::new(config().with_concurrency(2));
    client.start();
    client.start();
    for key in ["x", "y"] {
        client
            .copy(AnyBlob::Gs(fake.blob("src", key)), AnyBlob::Gs(fake.blob("dst", key)))
            .await;
    }
    let report = client.finish().await?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(fake.keys("dst"), vec!["x".to_string(), "y".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_best_effort_reports_every_failure() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "ok-1", payload(10));
    fake.insert("src", "ok-2", payload(20));
    let mut client = CopyClient::new(config().with_concurrency(2));
    for key in ["ok-1", "missing", "ok-2"] {
        client
            .copy(AnyBlob::Gs(fake.blob("src", key)), AnyBlob::Gs(fake.blob("dst", key)))
            .await;
    }
    let report = client.finish().await?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.cancelled, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].src, "gs://src/missing");
    assert!(!report.is_success());
    assert_eq!(fake.keys("dst"), vec!["ok-1".to_string(), "ok-2".to_string()]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fail_fast_cancels_pending_and_raises() -> Result<()> {
    let fake = FakeGcs::new();
    fake.insert("src", "a", payload(10));
    fake.insert("src", "b", payload(20));
    let dir = TempDir::new()?;
    let local = dir.path().join("big.bin");
    std::fs::write(&local, payload(5000))?;

    let mut client = CopyClient::new(config().with_concurrency(1).with_raise_on_error(true));
    // largest, so it runs first and fails
    client
        .copy(AnyBlob::Local(LocalBlob::from_path(&local)), AnyBlob::Gs(fake.blob("dst", "big.bin")))
        .await;
    for key in ["a", "b"] {
        client
            .copy(AnyBlob::Gs(fake.blob("src", key)), AnyBlob::Gs(fake.blob("dst", key)))
            .await;
    }
    let err = client.finish().await.unwrap_err();
    assert!(matches!(err, BlobStoreError::UnsupportedOperation(_)));
    assert!(fake.calls_of("rewrite").is_empty());
    assert!(fake.keys("dst").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_finish_without_jobs_is_empty_report() -> Result<()> {
    let report = CopyClient::new(config()).finish().await?;
    assert_eq!(report.succeeded, 0);
    assert!(report.is_success());
    Ok(())
}

#[tokio::test]
async fn test_copy_into_url_fails_in_pool() -> Result<()> {
    let dir = TempDir::new()?;
    let src = dir.path().join("x.txt");
    std::fs::write(&src, b"x")?;
    let mut client = CopyClient::new(config());
    client.copy_url(&src.display().to_string(), "https://example.invalid/x").await?;
    let report = client.finish().await?;
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("unsupported"));
    assert_eq!(std::fs::read(&src)?, b"x");
    Ok(())
}
