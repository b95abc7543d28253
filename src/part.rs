// src/part.rs
//
// Part model and the ordered, bounded-prefetch range reader shared by the
// network backends.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;

use crate::error::{BlobStoreError, Result};

/// A numbered chunk of a blob's content; the unit of streamed transfer.
///
/// Within one iteration, numbers start at 0 and increase by one. Every part
/// carries exactly `chunk_size` bytes except possibly the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub number: usize,
    pub data: Bytes,
}

impl Part {
    pub fn new(number: usize, data: impl Into<Bytes>) -> Self {
        Self { number, data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A boxed, pinned, sendable stream of parts.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<Part>> + Send + 'static>>;

/// A boxed stream of byte counts, one per completed part.
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<u64>> + Send + 'static>>;

/// Split `size` bytes into `(number, offset, length)` ranges of `chunk_size`.
///
/// A zero-sized object still yields one (empty) range so callers always see
/// at least one part.
pub fn part_ranges(size: u64, chunk_size: usize) -> Vec<(usize, u64, u64)> {
    let chunk = chunk_size.max(1) as u64;
    if size == 0 {
        return vec![(0, 0, 0)];
    }
    let count = size.div_ceil(chunk);
    (0..count)
        .map(|n| {
            let offset = n * chunk;
            (n as usize, offset, chunk.min(size - offset))
        })
        .collect()
}

/// Read an object as ordered parts using up to `concurrency` range fetches at once.
///
/// Fetches may complete out of order; `buffered` holds completed parts until
/// their turn so the consumer observes strictly increasing part numbers.
/// `fetch(offset, length)` is never called for the empty range of a zero-byte
/// object.
pub fn ranged_parts<F, Fut>(
    url: String,
    size: u64,
    chunk_size: usize,
    concurrency: usize,
    fetch: F,
) -> PartStream
where
    F: Fn(u64, u64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes>> + Send + 'static,
{
    let parts = stream::iter(part_ranges(size, chunk_size))
        .map(move |(number, offset, length)| {
            let fut = (length > 0).then(|| fetch(offset, length));
            let url = url.clone();
            async move {
                let data = match fut {
                    Some(fut) => fut.await?,
                    None => Bytes::new(),
                };
                if data.len() as u64 != length {
                    return Err(BlobStoreError::Backend(anyhow::anyhow!(
                        "short read for {} part {}: expected {} bytes, got {}",
                        url,
                        number,
                        length,
                        data.len()
                    )));
                }
                tracing::trace!("part {} of {} ready ({} bytes)", number, url, length);
                Ok(Part::new(number, data))
            }
        })
        .buffered(concurrency.max(1));
    Box::pin(parts)
}
