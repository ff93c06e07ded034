use crate::config::Config;
use crate::envelope::StorageKind;
use crate::error::BlobError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Claim-check payload storage: `fetch(key) -> bytes`, `delete(key)`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes, BlobError>;
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Filesystem backend rooted at `STORAGE_LOCAL_PATH`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        let clean = !key.trim().is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn fetch(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// MinIO or S3 bucket, addressed path-style so MinIO works without DNS.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn connect(config: &Config) -> Self {
        let scheme = if config.minio_use_ssl { "https" } else { "http" };
        let endpoint = format!("{scheme}://{}:{}", config.minio_endpoint, config.minio_port);
        let credentials = Credentials::new(
            config.minio_access_key.clone(),
            config.minio_secret_key.clone(),
            None,
            None,
            "telemetry-worker",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.s3_region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.minio_bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn fetch(&self, key: &str) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    BlobError::NotFound(key.to_string())
                } else {
                    BlobError::Remote(err.to_string())
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| BlobError::Remote(err.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| BlobError::Remote(err.into_service_error().to_string()))?;
        Ok(())
    }
}

/// Picks the backend named by an envelope's `storage_type`, falling back to
/// the configured default when the envelope does not say.
#[derive(Clone)]
pub struct BlobRouter {
    default_kind: StorageKind,
    object: Arc<dyn BlobStore>,
    local: Arc<dyn BlobStore>,
}

impl BlobRouter {
    pub fn new(
        default_kind: StorageKind,
        object: Arc<dyn BlobStore>,
        local: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            default_kind,
            object,
            local,
        }
    }

    pub async fn from_config(config: &Config) -> Self {
        let object: Arc<dyn BlobStore> = Arc::new(S3BlobStore::connect(config).await);
        let local: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(config.storage_local_path.clone()));
        Self::new(config.storage_type, object, local)
    }

    pub fn backend(&self, kind: Option<StorageKind>) -> &dyn BlobStore {
        match kind.unwrap_or(self.default_kind) {
            StorageKind::Local => self.local.as_ref(),
            StorageKind::Minio | StorageKind::S3 => self.object.as_ref(),
        }
    }
}
