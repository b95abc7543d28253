// src/constants.rs
//
// Centralized constants for tnu to avoid hardcoded values throughout the codebase

/// Default transfer granularity for chunked reads and multipart writes (32 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Objects at or below this size are copied with a single get/put (64 MiB)
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Concurrent range fetches / part uploads inside one transfer
pub const DEFAULT_IO_CONCURRENCY: usize = 4;

/// Maximum number of source objects GCS accepts in one compose request
pub const GCS_COMPOSE_MAX_SOURCES: usize = 32;

/// Page size requested from GCS list calls
pub const GCS_LIST_PAGE_SIZE: i32 = 1000;

/// Emit a progress log line every this many `add()` calls
pub const DEFAULT_PROGRESS_LOG_INTERVAL: u64 = 16;

// ============================================================================
// Environment variable names
// ============================================================================

/// Overrides [`DEFAULT_CHUNK_SIZE`]
pub const ENV_CHUNK_SIZE: &str = "TNU_CHUNK_SIZE";

/// Overrides [`DEFAULT_MULTIPART_THRESHOLD`]
pub const ENV_MULTIPART_THRESHOLD: &str = "TNU_MULTIPART_THRESHOLD";

/// Overrides the copy worker count (defaults to the CPU count)
pub const ENV_COPY_CONCURRENCY: &str = "TNU_COPY_CONCURRENCY";

/// Overrides [`DEFAULT_IO_CONCURRENCY`]
pub const ENV_IO_CONCURRENCY: &str = "TNU_IO_CONCURRENCY";

/// Service-account key file used for GCS requests
pub const ENV_GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Billing project for requester-pays buckets
pub const ENV_GOOGLE_PROJECT: &str = "GOOGLE_PROJECT";

/// Fallback billing project variable set by the gcloud tooling
pub const ENV_GCLOUD_PROJECT: &str = "GCLOUD_PROJECT";

/// Custom GCS endpoint (full URL), e.g. fake-gcs-server
pub const ENV_GCS_ENDPOINT_URL: &str = "GCS_ENDPOINT_URL";

/// GCS emulator convention: host:port
pub const ENV_STORAGE_EMULATOR_HOST: &str = "STORAGE_EMULATOR_HOST";

/// Azure storage account name
pub const ENV_AZURE_STORAGE_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";

/// Azure shared access key; takes precedence over the default credential chain
pub const ENV_AZURE_STORAGE_KEY: &str = "AZURE_STORAGE_KEY";

/// Blob service endpoint override (Azurite: http://127.0.0.1:10000/devstoreaccount1)
pub const ENV_AZURE_STORAGE_ENDPOINT: &str = "AZURE_STORAGE_ENDPOINT";

/// Azure list page size (service maximum)
pub const AZURE_LIST_PAGE_SIZE: u32 = 5000;
