// src/gcs_client.rs
//
// Google Cloud Storage client seam.
//
// `GcsApi` is the narrow set of object operations the GCS blob backend needs.
// `GcloudStorageApi` implements it on the google-cloud-storage crate; tests plug
// in an in-memory implementation. Every method translates a 404 into
// `BlobStoreError::NotFound` so callers never see SDK error types.
//
// Requester-pays attribution is a property of the connection: a client built
// with a billing project appends `userProject` to every request it sends.

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::objects::SourceObjects;
use google_cloud_storage::http::objects::compose::{ComposeObjectRequest, ComposingTargets};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::rewrite::RewriteObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use http::Extensions;
use reqwest_middleware::{ClientBuilder, Middleware, Next};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::constants::{ENV_GCS_ENDPOINT_URL, ENV_STORAGE_EMULATOR_HOST, GCS_LIST_PAGE_SIZE};
use crate::error::{BlobStoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    pub bucket: String,
    pub object: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// Same bucket, different object name.
    pub fn sibling(&self, object: impl Into<String>) -> Self {
        Self {
            bucket: self.bucket.clone(),
            object: object.into(),
        }
    }

    pub fn url(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.object)
    }
}

/// Provider-level object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsObjectMetadata {
    pub name: String,
    pub size: u64,
    /// Base64 big-endian crc32c, as GCS reports it.
    pub crc32c: Option<String>,
    /// Base64 md5; absent for composite objects.
    pub md5_hash: Option<String>,
    pub etag: Option<String>,
}

impl From<Object> for GcsObjectMetadata {
    fn from(obj: Object) -> Self {
        Self {
            name: obj.name,
            size: obj.size.max(0) as u64,
            crc32c: obj.crc32c,
            md5_hash: obj.md5_hash,
            etag: Some(obj.etag).filter(|e| !e.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<GcsObjectMetadata>,
    pub next_page_token: Option<String>,
}

/// One step of a server-side rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteProgress {
    pub total_bytes_rewritten: u64,
    pub object_size: u64,
    pub done: bool,
    pub rewrite_token: Option<String>,
}

#[async_trait]
pub trait GcsApi: Send + Sync {
    async fn stat(&self, path: &ObjectPath) -> Result<GcsObjectMetadata>;

    /// Inclusive byte range `(first, last)`; `None` downloads everything.
    async fn download(&self, path: &ObjectPath, range: Option<(u64, u64)>) -> Result<Bytes>;

    async fn upload(&self, path: &ObjectPath, data: Bytes) -> Result<GcsObjectMetadata>;

    async fn delete(&self, path: &ObjectPath) -> Result<()>;

    async fn list_page(&self, bucket: &str, prefix: Option<&str>, page_token: Option<String>) -> Result<ListPage>;

    /// Issue one rewrite call; pass the token from the previous response to continue.
    async fn rewrite(
        &self,
        src: &ObjectPath,
        dst: &ObjectPath,
        rewrite_token: Option<String>,
    ) -> Result<RewriteProgress>;

    /// Concatenate `sources` (object names in `dst.bucket`) into `dst`.
    async fn compose(&self, dst: &ObjectPath, sources: &[String]) -> Result<GcsObjectMetadata>;
}

/// `GcsApi` on top of the gcloud-storage client.
///
/// Authentication follows the standard ADC chain unless a service-account file
/// is given:
/// 1. explicit credentials file
/// 2. GOOGLE_APPLICATION_CREDENTIALS environment variable
/// 3. GCE/GKE metadata server
/// 4. gcloud CLI credentials
///
/// `GCS_ENDPOINT_URL` / `STORAGE_EMULATOR_HOST` redirect to an emulator with
/// anonymous access.
pub struct GcloudStorageApi {
    client: Client,
}

/// Appends `userProject=<project>` to every outgoing request.
struct UserProject {
    project: String,
}

#[async_trait]
impl Middleware for UserProject {
    async fn handle(
        &self,
        mut req: reqwest::Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        req.url_mut().query_pairs_mut().append_pair("userProject", &self.project);
        next.run(req, extensions).await
    }
}

impl GcloudStorageApi {
    pub async fn connect(credentials: Option<&Path>, billing_project: Option<&str>) -> Result<Self> {
        let mut config = if let Some(endpoint) = resolve_gcs_endpoint() {
            info!("Using custom GCS endpoint: {}", endpoint);
            ClientConfig {
                storage_endpoint: endpoint,
                ..ClientConfig::default()
            }
            .anonymous()
        } else if let Some(path) = credentials {
            debug!("Initializing GCS client with credentials file {}", path.display());
            let file = CredentialsFile::new_from_file(path.display().to_string())
                .await
                .map_err(|e| anyhow!("Failed to read GCS credentials {}: {}", path.display(), e))?;
            ClientConfig::default()
                .with_credentials(file)
                .await
                .map_err(|e| anyhow!("Failed to initialize GCS authentication: {}", e))?
        } else {
            debug!("Initializing GCS client with Application Default Credentials");
            ClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| anyhow!("Failed to initialize GCS authentication: {}", e))?
        };
        if let Some(project) = billing_project {
            debug!("Billing GCS requests to project {}", project);
            config.http = Some(
                ClientBuilder::new(reqwest::Client::default())
                    .with(UserProject { project: project.to_string() })
                    .build(),
            );
        }
        Ok(Self { client: Client::new(config) })
    }

    pub async fn connect_shared(credentials: Option<PathBuf>, billing_project: Option<String>) -> Result<Arc<dyn GcsApi>> {
        let api = Self::connect(credentials.as_deref(), billing_project.as_deref()).await?;
        Ok(Arc::new(api))
    }
}

fn is_not_found(err: &GcsError) -> bool {
    match err {
        GcsError::Response(resp) => resp.code == 404,
        GcsError::HttpClient(e) => e.status().map(|s| s.as_u16()) == Some(404),
        _ => false,
    }
}

/// Map an SDK error, turning 404 into `NotFound` for `url`.
fn translate(err: GcsError, op: &str, url: &str) -> BlobStoreError {
    if is_not_found(&err) {
        BlobStoreError::not_found(url)
    } else {
        BlobStoreError::Backend(anyhow!("GCS {} failed for {}: {}", op, url, err))
    }
}

fn get_request(path: &ObjectPath) -> GetObjectRequest {
    GetObjectRequest {
        bucket: path.bucket.clone(),
        object: path.object.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl GcsApi for GcloudStorageApi {
    async fn stat(&self, path: &ObjectPath) -> Result<GcsObjectMetadata> {
        debug!("GCS STAT: {}", path.url());
        let obj = self
            .client
            .get_object(&get_request(path))
            .await
            .map_err(|e| translate(e, "STAT", &path.url()))?;
        Ok(obj.into())
    }

    async fn download(&self, path: &ObjectPath, range: Option<(u64, u64)>) -> Result<Bytes> {
        debug!("GCS GET: {} range={:?}", path.url(), range);
        let range = match range {
            Some((first, last)) => Range(Some(first), Some(last)),
            None => Range::default(),
        };
        let data = self
            .client
            .download_object(&get_request(path), &range)
            .await
            .map_err(|e| translate(e, "GET", &path.url()))?;
        Ok(Bytes::from(data))
    }

    async fn upload(&self, path: &ObjectPath, data: Bytes) -> Result<GcsObjectMetadata> {
        debug!("GCS PUT: {} ({} bytes)", path.url(), data.len());
        let upload_type = UploadType::Simple(Media::new(path.object.clone()));
        let obj = self
            .client
            .upload_object(
                &UploadObjectRequest {
                    bucket: path.bucket.clone(),
                    ..Default::default()
                },
                data,
                &upload_type,
            )
            .await
            .map_err(|e| translate(e, "PUT", &path.url()))?;
        Ok(obj.into())
    }

    async fn delete(&self, path: &ObjectPath) -> Result<()> {
        debug!("GCS DELETE: {}", path.url());
        self.client
            .delete_object(&DeleteObjectRequest {
                bucket: path.bucket.clone(),
                object: path.object.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| translate(e, "DELETE", &path.url()))
    }

    async fn list_page(&self, bucket: &str, prefix: Option<&str>, page_token: Option<String>) -> Result<ListPage> {
        debug!("GCS LIST page: bucket={}, prefix={:?}", bucket, prefix);
        let response = self
            .client
            .list_objects(&ListObjectsRequest {
                bucket: bucket.to_string(),
                prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
                page_token,
                max_results: Some(GCS_LIST_PAGE_SIZE),
                ..Default::default()
            })
            .await
            .map_err(|e| translate(e, "LIST", &format!("gs://{}/", bucket)))?;
        Ok(ListPage {
            objects: response.items.unwrap_or_default().into_iter().map(Into::into).collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn rewrite(
        &self,
        src: &ObjectPath,
        dst: &ObjectPath,
        rewrite_token: Option<String>,
    ) -> Result<RewriteProgress> {
        debug!("GCS REWRITE: {} -> {} (continuing={})", src.url(), dst.url(), rewrite_token.is_some());
        let response = self
            .client
            .rewrite_object(&RewriteObjectRequest {
                destination_bucket: dst.bucket.clone(),
                destination_object: dst.object.clone(),
                source_bucket: src.bucket.clone(),
                source_object: src.object.clone(),
                rewrite_token,
                ..Default::default()
            })
            .await
            .map_err(|e| translate(e, "REWRITE", &src.url()))?;
        Ok(RewriteProgress {
            total_bytes_rewritten: response.total_bytes_rewritten.max(0) as u64,
            object_size: response.object_size.max(0) as u64,
            done: response.done,
            rewrite_token: response.rewrite_token.filter(|t| !t.is_empty()),
        })
    }

    async fn compose(&self, dst: &ObjectPath, sources: &[String]) -> Result<GcsObjectMetadata> {
        debug!("GCS COMPOSE: {} sources -> {}", sources.len(), dst.url());
        let obj = self
            .client
            .compose_object(&ComposeObjectRequest {
                bucket: dst.bucket.clone(),
                destination_object: dst.object.clone(),
                composing_targets: ComposingTargets {
                    destination: None,
                    source_objects: sources
                        .iter()
                        .map(|name| SourceObjects {
                            name: name.clone(),
                            ..Default::default()
                        })
                        .collect(),
                },
                ..Default::default()
            })
            .await
            .map_err(|e| translate(e, "COMPOSE", &dst.url()))?;
        Ok(obj.into())
    }
}

/// Parse `gs://bucket/key` into `(bucket, key)`.
///
/// Unlike listing prefixes, a blob locator must name an object: a bare
/// `gs://bucket` or `gs://bucket/` is rejected.
///
/// ```
/// use tnu::gcs_client::parse_gcs_uri;
///
/// let (bucket, key) = parse_gcs_uri("gs://my-bucket/path/to/sample.vcf.gz").unwrap();
/// assert_eq!(bucket, "my-bucket");
/// assert_eq!(key, "path/to/sample.vcf.gz");
/// assert!(parse_gcs_uri("gs://my-bucket").is_err());
/// ```
pub fn parse_gcs_uri(uri: &str) -> Result<(String, String)> {
    let path = uri
        .strip_prefix("gs://")
        .ok_or_else(|| BlobStoreError::Configuration(format!("expected gs:// locator, got {}", uri)))?;
    let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
    if bucket.is_empty() {
        return Err(BlobStoreError::Configuration(format!("empty bucket name in {}", uri)));
    }
    if key.is_empty() {
        return Err(BlobStoreError::Configuration(format!("missing object key in {}", uri)));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Resolves a custom GCS storage endpoint from `GCS_ENDPOINT_URL` or
/// `STORAGE_EMULATOR_HOST`; `None` means the public endpoint.
pub fn resolve_gcs_endpoint() -> Option<String> {
    std::env::var(ENV_GCS_ENDPOINT_URL).ok().or_else(|| {
        std::env::var(ENV_STORAGE_EMULATOR_HOST).ok().map(|host| {
            if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{}", host)
            }
        })
    })
}
