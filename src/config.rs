// src/config.rs
//
// Transfer tuning and backend settings, with environment overrides.

use clap::ValueEnum;
use std::path::PathBuf;
use tracing::warn;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_IO_CONCURRENCY, DEFAULT_MULTIPART_THRESHOLD, ENV_AZURE_STORAGE_ACCOUNT,
    ENV_AZURE_STORAGE_ENDPOINT, ENV_AZURE_STORAGE_KEY, ENV_CHUNK_SIZE, ENV_COPY_CONCURRENCY, ENV_GCLOUD_PROJECT,
    ENV_GOOGLE_APPLICATION_CREDENTIALS, ENV_GOOGLE_PROJECT, ENV_IO_CONCURRENCY, ENV_MULTIPART_THRESHOLD,
};

/// How transfer progress is rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum IndicatorKind {
    /// Nothing at all
    Silent,
    /// Periodic tracing lines
    Log,
    /// indicatif bar on stderr
    Bar,
    /// `Bar` when stderr is a terminal, otherwise `Log`
    #[default]
    Auto,
}

/// Runtime parameters used by the copy engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub multipart_threshold: u64, // sources above this go through a part writer
    pub copy_concurrency: usize,  // worker tasks per CopyClient
    pub io_concurrency: usize,    // range fetches / part uploads inside one transfer
    pub raise_on_error: bool,
    pub indicator: IndicatorKind,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            copy_concurrency: num_cpus::get(),
            io_concurrency: DEFAULT_IO_CONCURRENCY,
            raise_on_error: false,
            indicator: IndicatorKind::default(),
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by `TNU_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, ENV_CHUNK_SIZE) {
            config.chunk_size = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_MULTIPART_THRESHOLD) {
            config.multipart_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_COPY_CONCURRENCY) {
            config.copy_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_IO_CONCURRENCY) {
            config.io_concurrency = v;
        }
        config.normalized()
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.copy_concurrency = workers;
        self.normalized()
    }

    pub fn with_raise_on_error(mut self, raise_on_error: bool) -> Self {
        self.raise_on_error = raise_on_error;
        self
    }

    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self.normalized()
    }

    pub fn with_indicator(mut self, indicator: IndicatorKind) -> Self {
        self.indicator = indicator;
        self
    }

    /// Zero sizes and widths are clamped to one.
    fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.max(1);
        self.copy_concurrency = self.copy_concurrency.max(1);
        self.io_concurrency = self.io_concurrency.max(1);
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

/// Google Cloud credentials and requester-pays attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsSettings {
    /// Service-account key file; `None` uses Application Default Credentials
    pub credentials: Option<PathBuf>,
    pub billing_project: Option<String>,
}

impl GcsSettings {
    pub fn from_env() -> Self {
        Self {
            credentials: std::env::var_os(ENV_GOOGLE_APPLICATION_CREDENTIALS).map(PathBuf::from),
            billing_project: None,
        }
    }

    /// Bill requests to `GOOGLE_PROJECT`, falling back to `GCLOUD_PROJECT`.
    pub fn with_requester_pays_from_env(mut self) -> Self {
        self.billing_project = std::env::var(ENV_GOOGLE_PROJECT)
            .or_else(|_| std::env::var(ENV_GCLOUD_PROJECT))
            .ok()
            .filter(|p| !p.is_empty());
        self
    }
}

/// Azure account and how to authenticate against it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AzureSettings {
    pub account: Option<String>,
    /// Shared access key; when present it wins over the default credential chain
    pub access_key: Option<String>,
    /// Override of `https://{account}.blob.core.windows.net`, e.g. Azurite
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for AzureSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureSettings")
            .field("account", &self.account)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl AzureSettings {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            account: var(ENV_AZURE_STORAGE_ACCOUNT),
            access_key: var(ENV_AZURE_STORAGE_KEY),
            endpoint: var(ENV_AZURE_STORAGE_ENDPOINT),
        }
    }

    /// Blob service endpoint for `account`.
    pub fn account_url(&self, account: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", account),
        }
    }
}
