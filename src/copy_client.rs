// src/copy_client.rs
//
// Copy engine: strategy selection, integrity verification, and a bounded
// pool of worker tasks fed from a largest-first priority queue.
//
// Strategy table, evaluated in order:
// 1. destination is local                 -> Download (source's own verified download)
// 2. same cloud backend, rewrite allowed  -> IntraCloud (server-side copy, checksums compared)
// 3. cloud destination, URL/cloud source  -> Oneshot (size <= threshold) or Multipart
// 4. anything else                        -> UnsupportedOperation
//
// A failed transfer deletes whatever part of the destination was written.

use futures::StreamExt;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::{AnyBlob, Blob, blob_for_url_with_config, warn_unverified};
use crate::checksum::{Checksum, ChecksumAlgorithm, ChecksumHasher};
use crate::config::TransferConfig;
use crate::error::{BlobStoreError, Result};
use crate::part::ProgressStream;
use crate::progress::ProgressGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    Download,
    IntraCloud,
    Oneshot,
    Multipart,
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CopyStrategy::Download => "download",
            CopyStrategy::IntraCloud => "intra-cloud",
            CopyStrategy::Oneshot => "oneshot",
            CopyStrategy::Multipart => "multipart",
        })
    }
}

/// Pick the transfer strategy for `src -> dst`.
///
/// Only passthrough candidates cost a size lookup on the source.
pub async fn plan_copy(src: &AnyBlob, dst: &AnyBlob, multipart_threshold: u64) -> Result<CopyStrategy> {
    match (src, dst) {
        (_, AnyBlob::Local(_)) => Ok(CopyStrategy::Download),
        (AnyBlob::Gs(s), AnyBlob::Gs(d)) if !s.requires_billing() && !d.requires_billing() => {
            Ok(CopyStrategy::IntraCloud)
        }
        (AnyBlob::Url(_) | AnyBlob::Gs(_) | AnyBlob::Azure(_), AnyBlob::Gs(_) | AnyBlob::Azure(_)) => {
            if src.size().await? <= multipart_threshold {
                Ok(CopyStrategy::Oneshot)
            } else {
                Ok(CopyStrategy::Multipart)
            }
        }
        _ => Err(BlobStoreError::UnsupportedOperation(format!(
            "cannot copy {} to {}",
            src.kind(),
            dst.kind()
        ))),
    }
}

async fn drain(mut progress: ProgressStream, indicator: &ProgressGuard) -> Result<u64> {
    let mut total = 0;
    while let Some(bytes) = progress.next().await {
        let bytes = bytes?;
        total += bytes;
        indicator.add(bytes);
    }
    Ok(total)
}

/// Digests of the bytes a passthrough copy moves.
///
/// The destination's algorithm is always computed. When the source declares a
/// checksum in another algorithm, that algorithm is computed as well so the
/// declaration is checked against the bytes actually read.
struct PassthroughDigest {
    declared: Option<Checksum>,
    hashers: Vec<ChecksumHasher>,
}

impl PassthroughDigest {
    async fn new(src: &AnyBlob, algorithm: ChecksumAlgorithm) -> Result<Self> {
        let declared = src.cloud_native_checksum().await?;
        let mut hashers = vec![ChecksumHasher::new(algorithm)];
        if let Some(declared) = declared.as_ref().filter(|c| c.algorithm != algorithm) {
            hashers.push(ChecksumHasher::new(declared.algorithm));
        }
        Ok(Self { declared, hashers })
    }

    fn update(&mut self, data: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Check the source's declaration, then what the destination stored.
    async fn verify(self, src: &AnyBlob, dst: &AnyBlob) -> Result<()> {
        let read: Vec<Checksum> = self.hashers.into_iter().map(ChecksumHasher::finalize).collect();
        let Some(sent) = read.first().cloned() else {
            return Ok(());
        };

        if let Some(declared) = self.declared {
            if let Some(actual) = read.into_iter().find(|c| c.algorithm == declared.algorithm) {
                if actual != declared {
                    return Err(BlobStoreError::ChecksumMismatch {
                        url: src.url(),
                        expected: declared,
                        actual,
                    });
                }
                debug!("{} matches its declared {}", src.url(), declared);
            }
        }

        match dst.cloud_native_checksum().await? {
            Some(stored) if stored.algorithm == sent.algorithm => {
                if stored != sent {
                    return Err(BlobStoreError::ChecksumMismatch {
                        url: dst.url(),
                        expected: sent,
                        actual: stored,
                    });
                }
                debug!("{} verified ({})", dst.url(), stored);
                Ok(())
            }
            _ => {
                warn_unverified(&dst.url());
                Ok(())
            }
        }
    }
}

async fn intra_cloud(src: &AnyBlob, dst: &AnyBlob, indicator: &ProgressGuard) -> Result<()> {
    let (AnyBlob::Gs(s), AnyBlob::Gs(d)) = (src, dst) else {
        return Err(BlobStoreError::UnsupportedOperation(format!(
            "no server-side copy from {} to {}",
            src.kind(),
            dst.kind()
        )));
    };
    drain(d.copy_from_iter(s).await?, indicator).await?;
    let (expected, actual) = (src.cloud_native_checksum().await?, dst.cloud_native_checksum().await?);
    match (expected, actual) {
        (Some(expected), Some(actual)) if expected != actual => Err(BlobStoreError::ChecksumMismatch {
            url: dst.url(),
            expected,
            actual,
        }),
        (Some(_), Some(_)) => Ok(()),
        _ => {
            warn_unverified(&dst.url());
            Ok(())
        }
    }
}

async fn oneshot(src: &AnyBlob, dst: &AnyBlob, algorithm: ChecksumAlgorithm, indicator: &ProgressGuard) -> Result<()> {
    let mut digest = PassthroughDigest::new(src, algorithm).await?;
    let data = src.get().await?;
    digest.update(&data);
    let len = data.len() as u64;
    dst.put(data).await?;
    indicator.add(len);
    digest.verify(src, dst).await
}

async fn multipart(src: &AnyBlob, dst: &AnyBlob, algorithm: ChecksumAlgorithm, indicator: &ProgressGuard) -> Result<()> {
    let mut digest = PassthroughDigest::new(src, algorithm).await?;
    let mut parts = src.iter_content().await?;
    let mut writer = dst.part_writer().await?;
    // On error the writer is dropped unclosed, which never finalizes the destination
    while let Some(part) = parts.next().await {
        let part = part?;
        digest.update(&part.data);
        let len = part.len() as u64;
        writer.put_part(part).await?;
        indicator.add(len);
    }
    writer.close().await?;
    digest.verify(src, dst).await
}

/// Run one transfer with the given strategy.
///
/// On failure the destination is deleted (unless it is the source itself)
/// and the original error is returned.
pub async fn do_copy(src: &AnyBlob, dst: &AnyBlob, config: &TransferConfig) -> Result<CopyStrategy> {
    let result = async {
        let strategy = plan_copy(src, dst, config.multipart_threshold).await?;
        debug!("copying {} -> {} ({})", src.url(), dst.url(), strategy);
        let total = match strategy {
            CopyStrategy::Download | CopyStrategy::IntraCloud => 0,
            _ => src.size().await.unwrap_or(0),
        };
        let indicator = ProgressGuard::new(config.indicator.create(&dst.url(), total));
        let algorithm = dst.native_checksum_algorithm().unwrap_or(ChecksumAlgorithm::Md5);
        match strategy {
            CopyStrategy::Download => {
                let AnyBlob::Local(local) = dst else {
                    return Err(BlobStoreError::UnsupportedOperation(format!("{} is not a local path", dst.url())));
                };
                drain(src.download_iter(local.path()).await?, &indicator).await?;
            }
            CopyStrategy::IntraCloud => intra_cloud(src, dst, &indicator).await?,
            CopyStrategy::Oneshot => oneshot(src, dst, algorithm, &indicator).await?,
            CopyStrategy::Multipart => multipart(src, dst, algorithm, &indicator).await?,
        }
        Ok(strategy)
    }
    .await;

    if let Err(e) = &result {
        error!("copy {} -> {} failed: {}", src.url(), dst.url(), e);
        if src.url() != dst.url() && !matches!(e, BlobStoreError::UnsupportedOperation(_)) {
            match dst.delete().await {
                Ok(()) => debug!("removed partial destination {}", dst.url()),
                Err(cleanup) if cleanup.is_not_found() => {}
                Err(cleanup) => warn!("cleanup of {} failed: {}", dst.url(), cleanup),
            }
        }
    }
    result
}

/// Copy `src` to `dst` given as locator strings.
pub async fn copy_url(src: &str, dst: &str, config: &TransferConfig) -> Result<CopyStrategy> {
    let src = blob_for_url_with_config(src, config)?;
    let dst = blob_for_url_with_config(dst, config)?;
    do_copy(&src, &dst, config).await
}

// ============================================================================
// Concurrent client
// ============================================================================

struct Job {
    size: u64,
    seq: u64,
    src: AnyBlob,
    dst: AnyBlob,
}

// Max-heap: larger sources first, then submission order.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.size.cmp(&other.size).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Job {}

#[derive(Debug, Clone)]
pub struct CopyFailure {
    pub src: String,
    pub dst: String,
    pub error: String,
}

/// Outcome of a batch.
#[derive(Debug, Clone, Default)]
pub struct CopyReport {
    pub succeeded: usize,
    pub failures: Vec<CopyFailure>,
    /// Jobs dropped before they started because of a fail-fast abort
    pub cancelled: usize,
}

impl CopyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled == 0
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Job>>,
    // One permit per queued job; closed once no more jobs will arrive
    ready: Semaphore,
    abort: CancellationToken,
    succeeded: AtomicUsize,
    cancelled: AtomicUsize,
    failures: Mutex<Vec<CopyFailure>>,
    first_error: Mutex<Option<BlobStoreError>>,
}

impl Shared {
    fn pop(&self) -> Option<Job> {
        if self.abort.is_cancelled() {
            return None;
        }
        self.queue.lock().ok()?.pop()
    }

    /// Drop every job that has not started.
    fn cancel_pending(&self) {
        let dropped = self.queue.lock().map(|mut q| std::mem::take(&mut *q).len()).unwrap_or(0);
        self.cancelled.fetch_add(dropped, Ordering::Relaxed);
        self.abort.cancel();
        self.ready.close();
        if dropped > 0 {
            warn!("{} queued copies cancelled", dropped);
        }
    }

    fn record_failure(&self, job: &Job, err: BlobStoreError, raise_on_error: bool) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(CopyFailure {
                src: job.src.url(),
                dst: job.dst.url(),
                error: err.to_string(),
            });
        }
        if raise_on_error {
            if let Ok(mut first) = self.first_error.lock() {
                first.get_or_insert(err);
            }
            self.cancel_pending();
        }
    }
}

async fn worker(id: usize, shared: Arc<Shared>, config: TransferConfig) {
    loop {
        // A closed semaphore means "drain what is left, then stop"
        let closed = match shared.ready.acquire().await {
            Ok(permit) => {
                permit.forget();
                false
            }
            Err(_) => true,
        };
        let Some(job) = shared.pop() else {
            if closed {
                break;
            }
            continue;
        };
        debug!("worker {} starting {} -> {} ({} bytes)", id, job.src.url(), job.dst.url(), job.size);
        match do_copy(&job.src, &job.dst, &config).await {
            Ok(strategy) => {
                shared.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("copied {} -> {} ({})", job.src.url(), job.dst.url(), strategy);
            }
            Err(e) => shared.record_failure(&job, e, config.raise_on_error),
        }
    }
    debug!("worker {} exiting", id);
}

/// Bounded pool of copy workers with a largest-first queue.
///
/// `copy` only enqueues. Workers are started by `start`, or by `finish` when
/// `start` was never called, so a batch queued up front is dispatched strictly
/// largest first. Jobs queued after the workers are running are picked up as
/// workers free up; their order relative to jobs already running is only a
/// hint. `finish` waits for every queued job; under fail-fast
/// (`raise_on_error`) the first failure cancels jobs that have not started and
/// is returned from `finish`. Dropping the client without `finish` cancels
/// everything still queued.
pub struct CopyClient {
    config: TransferConfig,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_seq: AtomicU64,
}

impl CopyClient {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                queue: Mutex::new(BinaryHeap::new()),
                ready: Semaphore::new(0),
                abort: CancellationToken::new(),
                succeeded: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
                first_error: Mutex::new(None),
            }),
            workers: Vec::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start the workers now instead of at `finish`. Idempotent.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        debug!("starting {} copy workers", self.config.copy_concurrency);
        for id in 0..self.config.copy_concurrency.max(1) {
            let shared = Arc::clone(&self.shared);
            let config = self.config.clone();
            self.workers.push(tokio::spawn(worker(id, shared, config)));
        }
    }

    /// Queue `src -> dst`. A source whose size cannot be read is queued with
    /// the lowest priority and fails when it runs.
    pub async fn copy(&mut self, src: AnyBlob, dst: AnyBlob) {
        if self.shared.abort.is_cancelled() {
            warn!("copy {} -> {} not started: batch aborted", src.url(), dst.url());
            self.shared.cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let src = src.configured(&self.config);
        let dst = dst.configured(&self.config);
        let size = match src.size().await {
            Ok(size) => size,
            Err(e) => {
                debug!("size of {} unknown ({}); queued last", src.url(), e);
                0
            }
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.push(Job { size, seq, src, dst });
        }
        self.shared.ready.add_permits(1);
    }

    /// `copy` with locator strings.
    pub async fn copy_url(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = blob_for_url_with_config(src, &self.config)?;
        let dst = blob_for_url_with_config(dst, &self.config)?;
        self.copy(src, dst).await;
        Ok(())
    }

    /// Wait for every queued copy and report.
    pub async fn finish(mut self) -> Result<CopyReport> {
        self.start();
        self.shared.ready.close();
        for handle in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.await {
                error!("copy worker panicked: {}", e);
            }
        }
        if let Some(err) = self.shared.first_error.lock().ok().and_then(|mut e| e.take()) {
            return Err(err);
        }
        let failures = self.shared.failures.lock().map(|f| f.clone()).unwrap_or_default();
        let report = CopyReport {
            succeeded: self.shared.succeeded.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
            failures,
        };
        if !report.failures.is_empty() {
            warn!("{} of {} copies failed", report.failures.len(), report.failures.len() + report.succeeded);
        }
        Ok(report)
    }
}

impl Drop for CopyClient {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        warn!("copy client dropped without finish(); cancelling queued copies");
        self.shared.cancel_pending();
        for handle in &self.workers {
            handle.abort();
        }
    }
}
