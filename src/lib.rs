// src/lib.rs
//
// Crate root: blob backends, the copy engine, and their public re-exports.

// ===== Core =====
pub mod constants;
pub mod error;
pub mod checksum;
pub mod config;
pub mod part;
pub mod progress;

// ===== Blob contract and backends =====
pub mod blob;
pub mod local_store;
pub mod gcs_client;
pub mod gs_store;
pub mod azure_client;
pub mod azure_store;
pub mod url_store;

// ===== Copy engine and locator resolution =====
pub mod copy_client;
pub mod drs;

pub use blob::{AnyBlob, Blob, BlobDescriptor, BlobKind, BlobStore, PartWriter, blob_for_url, blob_for_url_with_config};
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use config::{AzureSettings, GcsSettings, IndicatorKind, TransferConfig};
pub use copy_client::{CopyClient, CopyFailure, CopyReport, CopyStrategy, copy_url, do_copy, plan_copy};
pub use drs::{DrsResolver, ResolvedLocation, resolve_locator};
pub use error::{BlobStoreError, Result};
pub use part::{Part, PartStream, ProgressStream};

pub use azure_store::{AzureBlob, AzureBlobStore};
pub use gs_store::{GSBlob, GSBlobStore};
pub use local_store::{LocalBlob, LocalBlobStore};
pub use url_store::URLBlob;
