// src/bin/cli.rs
//
//! CLI for copying, listing and inspecting blobs across backends.
//!
//! Examples:
//! ```bash
//! tnu copy  gs://bucket/sample.cram   ./sample.cram
//! tnu copy  https://host/ref.fa       gs://bucket/ref/ref.fa
//! tnu copy-batch --dst gs://bucket/out/ gs://src/a.vcf gs://src/b.vcf -j 8
//! tnu copy-batch --manifest jobs.json --raise-on-error
//! tnu ls    az://account/container/prefix/
//! tnu stat  gs://bucket/sample.cram
//! ```

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tnu::drs::is_drs_uri;
use tnu::gcs_client::parse_gcs_uri;
use tnu::{
    AnyBlob, AzureBlobStore, AzureSettings, Blob, BlobStore, CopyClient, CopyFailure, CopyReport, GSBlob, GSBlobStore,
    GcsSettings, IndicatorKind, LocalBlobStore, TransferConfig, blob_for_url_with_config, do_copy,
};

/// Print to stdout, exiting quietly when the pipe is closed (e.g. `| head`)
macro_rules! safe_println {
    ($($arg:tt)*) => {
        match writeln!(io::stdout(), $($arg)*) {
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                std::process::exit(0);
            }
            Err(e) => return Err(e.into())
        }
    };
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity: -v = Info, -vv = Debug",
    )]
    verbose: u8,

    /// Progress display for transfers
    #[arg(long, value_enum, default_value_t = IndicatorKind::Auto)]
    progress: IndicatorKind,

    /// Part size in bytes for chunked transfers (overrides TNU_CHUNK_SIZE)
    #[arg(long = "chunk-size")]
    chunk_size: Option<usize>,

    /// Bill GCS requests to GOOGLE_PROJECT / GCLOUD_PROJECT
    #[arg(long = "requester-pays")]
    requester_pays: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy one blob.
    Copy {
        /// Source locator (gs://, az://, http(s)://, or a local path)
        src: String,
        /// Destination locator
        dst: String,
    },
    /// Copy many blobs concurrently, largest first.
    CopyBatch {
        /// Source locators; each lands under --dst with its base name
        uris: Vec<String>,

        /// Destination prefix for `uris` (a directory or a `gs://`/`az://` prefix)
        #[arg(long)]
        dst: Option<String>,

        /// JSON file of `[{"locator": ..., "dst": ...}]` pairs
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Stop at the first failure instead of attempting every copy
        #[arg(long = "raise-on-error")]
        raise_on_error: bool,

        /// Concurrent copies
        #[arg(short = 'j', long = "jobs")]
        jobs: Option<usize>,
    },
    /// List blobs under a prefix.
    Ls {
        /// `gs://bucket/prefix`, `az://account/container/prefix`, or a local directory
        uri: String,
    },
    /// Show size and native checksum of one blob.
    Stat {
        uri: String,
    },
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(alias = "src")]
    locator: String,
    dst: String,
}

// -----------------------------------------------------------------------------
// Command implementations
// -----------------------------------------------------------------------------

fn reject_drs(locator: &str) -> Result<()> {
    if is_drs_uri(locator) {
        bail!("{} must be resolved to a storage location before copying", locator);
    }
    Ok(())
}

/// Build a blob for `locator`, applying GCS credentials and requester-pays billing.
fn open_blob(locator: &str, config: &TransferConfig, gcs: &GcsSettings) -> Result<AnyBlob> {
    reject_drs(locator)?;
    Ok(match blob_for_url_with_config(locator, config)? {
        AnyBlob::Gs(b) => AnyBlob::Gs(GSBlob::new(
            b.bucket(),
            b.key(),
            gcs.credentials.clone(),
            gcs.billing_project.clone(),
        ))
        .configured(config),
        other => other,
    })
}

/// `prefix` joined with the base name of `src`.
fn destination_for(src: &str, prefix: &str) -> String {
    let name = src
        .split('?')
        .next()
        .unwrap_or(src)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(src);
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

async fn copy_cmd(src: &str, dst: &str, config: &TransferConfig, gcs: &GcsSettings) -> Result<()> {
    let src = open_blob(src, config, gcs)?;
    let dst = open_blob(dst, config, gcs)?;
    let t0 = Instant::now();
    let strategy = do_copy(&src, &dst, config).await?;
    info!("{} -> {} ({}) in {:.2?}", src.url(), dst.url(), strategy, t0.elapsed());
    Ok(())
}

/// Copy every pair through one `CopyClient`.
///
/// Best-effort (the default) reports failed items, including locators that do
/// not parse, and still succeeds. With `raise_on_error` the first bad locator
/// or failed copy is returned as the error.
async fn copy_batch_cmd(pairs: Vec<(String, String)>, config: TransferConfig, gcs: &GcsSettings) -> Result<CopyReport> {
    if pairs.is_empty() {
        bail!("nothing to copy: give source locators with --dst, or --manifest");
    }
    let total = pairs.len();
    let mut jobs = Vec::with_capacity(total);
    let mut rejected = Vec::new();
    for (src, dst) in pairs {
        let opened = open_blob(&src, &config, gcs).and_then(|s| Ok((s, open_blob(&dst, &config, gcs)?)));
        match opened {
            Ok(job) => jobs.push(job),
            Err(e) if config.raise_on_error => return Err(e.context(format!("cannot copy {} -> {}", src, dst))),
            Err(e) => {
                warn!("skipping {} -> {}: {:#}", src, dst, e);
                rejected.push(CopyFailure {
                    src,
                    dst,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    let mut client = CopyClient::new(config.clone());
    for (src, dst) in jobs {
        client.copy(src, dst).await;
    }
    let t0 = Instant::now();
    let mut report = client.finish().await?;
    report.failures.extend(rejected);
    for failure in &report.failures {
        safe_println!("FAILED {} -> {}: {}", failure.src, failure.dst, failure.error);
    }
    info!("{} of {} copies succeeded in {:.2?}", report.succeeded, total, t0.elapsed());
    Ok(report)
}

async fn ls_cmd(uri: &str, config: &TransferConfig, gcs: &GcsSettings) -> Result<()> {
    let mut count = 0usize;
    if let Some(rest) = uri.strip_prefix("gs://") {
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        // validates the bucket name the same way blob locators are validated
        parse_gcs_uri(&format!("gs://{}/_", bucket))?;
        let store = GSBlobStore::new(bucket)
            .with_credentials(gcs.credentials.clone())
            .with_billing_project(gcs.billing_project.clone())
            .with_chunk_size(config.chunk_size);
        let mut blobs = store.list(prefix);
        while let Some(blob) = blobs.next().await {
            safe_println!("{}", blob?.url());
            count += 1;
        }
    } else if let Some(rest) = uri.strip_prefix("az://") {
        let mut parts = rest.splitn(3, '/');
        let (Some(account), Some(container)) = (parts.next(), parts.next()) else {
            bail!("Azure prefix must look like az://account/container[/prefix], got {}", uri);
        };
        let prefix = parts.next().unwrap_or("");
        let store = AzureBlobStore::new(account, container)
            .with_settings(AzureSettings::from_env())
            .with_chunk_size(config.chunk_size);
        let mut blobs = store.list(prefix);
        while let Some(blob) = blobs.next().await {
            safe_println!("{}", blob?.url());
            count += 1;
        }
    } else if uri.starts_with("http://") || uri.starts_with("https://") || is_drs_uri(uri) {
        bail!("listing is not supported for {}", uri);
    } else {
        let base = std::path::absolute(uri).with_context(|| format!("invalid path {}", uri))?;
        let store = LocalBlobStore::new(base).with_chunk_size(config.chunk_size);
        let mut blobs = store.list("");
        while let Some(blob) = blobs.next().await {
            safe_println!("{}", blob?.url());
            count += 1;
        }
    }
    info!("{} blobs under {}", count, uri);
    Ok(())
}

async fn stat_cmd(uri: &str, config: &TransferConfig, gcs: &GcsSettings) -> Result<()> {
    let blob = open_blob(uri, config, gcs)?;
    let size = blob.size().await?;
    safe_println!("URL      : {}", blob.url());
    safe_println!("Backend  : {}", blob.kind());
    safe_println!("Size     : {}", size);
    match blob.cloud_native_checksum().await {
        Ok(Some(checksum)) => safe_println!("Checksum : {}", checksum),
        Ok(None) => safe_println!("Checksum : -"),
        Err(e) => warn!("could not read checksum of {}: {}", blob.url(), e),
    }
    Ok(())
}

/// Main CLI function
#[tokio::main]
async fn main() -> Result<()> {
    // Loads any variables from .env file that are not already set
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = TransferConfig::from_env().with_indicator(cli.progress);
    if let Some(chunk_size) = cli.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    let mut gcs = GcsSettings::from_env();
    if cli.requester_pays {
        gcs = gcs.with_requester_pays_from_env();
        if gcs.billing_project.is_none() {
            bail!("--requester-pays needs GOOGLE_PROJECT or GCLOUD_PROJECT");
        }
    }

    match cli.cmd {
        Command::Copy { src, dst } => copy_cmd(&src, &dst, &config, &gcs).await?,

        Command::CopyBatch {
            uris,
            dst,
            manifest,
            raise_on_error,
            jobs,
        } => {
            let mut pairs = Vec::new();
            if let Some(path) = manifest {
                let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                let entries: Vec<ManifestEntry> =
                    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
                pairs.extend(entries.into_iter().map(|e| (e.locator, e.dst)));
            }
            if !uris.is_empty() {
                let Some(prefix) = dst.as_deref() else {
                    bail!("--dst is required when source locators are given");
                };
                pairs.extend(uris.iter().map(|src| (src.clone(), destination_for(src, prefix))));
            }
            let mut config = config.with_raise_on_error(raise_on_error);
            if let Some(jobs) = jobs {
                config = config.with_concurrency(jobs);
            }
            copy_batch_cmd(pairs, config, &gcs).await?;
        }

        Command::Ls { uri } => ls_cmd(&uri, &config, &gcs).await?,

        Command::Stat { uri } => stat_cmd(&uri, &config, &gcs).await?,
    }

    Ok(())
}
