//! src/services/storage_service.rs
//!
//! StorageService: read access to the watched bucket through the
//! `object_store` crate. The same service fronts a real S3 bucket (or any
//! S3-compatible endpoint) and a local directory laid out like a bucket, which
//! is what development and the integration tests use.
//!
//! Everything above this module depends on the narrow [`BucketStorage`] trait
//! rather than on `object_store` directly.

use crate::{config::S3Config, models::object::BucketObject};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::{
    Attribute, ClientOptions, ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem,
    path::Path as ObjectPath,
};
use std::{fmt, io, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::debug;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const S3_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("storage is misconfigured: {0}")]
    Config(String),
    #[error("storage request failed: {0}")]
    Transport(#[source] object_store::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound { key: path },
            other => StorageError::Transport(other),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Body of a fetched object plus the headers needed to pass it through.
pub struct ObjectBody {
    pub stream: BoxStream<'static, io::Result<Bytes>>,
    pub content_type: Option<String>,
    pub content_length: u64,
}

impl ObjectBody {
    /// Wrap an in-memory payload.
    pub fn from_bytes(data: Bytes, content_type: Option<String>) -> Self {
        let content_length = data.len() as u64;
        Self {
            stream: futures::stream::once(async move { Ok(data) }).boxed(),
            content_type,
            content_length,
        }
    }

    /// Drain the stream into a single buffer.
    pub async fn bytes(mut self) -> StorageResult<Bytes> {
        let capacity = usize::try_from(self.content_length).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(capacity);
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Listing and retrieval capability the indexer, query engine and hub use.
#[async_trait]
pub trait BucketStorage: Send + Sync {
    /// List every object under `prefix` (`""` lists the whole bucket).
    async fn list(&self, prefix: &str) -> StorageResult<Vec<BucketObject>>;

    /// Fetch an object's content by key.
    async fn get(&self, key: &str) -> StorageResult<ObjectBody>;

    /// Human-readable location, for logs and readiness output.
    fn location(&self) -> String;
}

/// `BucketStorage` over any `object_store` backend.
#[derive(Clone)]
pub struct StorageService {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl StorageService {
    /// Wrap an already-built store.
    pub fn from_store(store: Arc<dyn ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    /// Connect to an S3 (or S3-compatible) bucket.
    ///
    /// Static credentials are used when configured; otherwise `object_store`
    /// falls back to the usual AWS environment and instance credentials.
    pub fn s3(cfg: &S3Config) -> StorageResult<Self> {
        if cfg.bucket.is_empty() {
            return Err(StorageError::Config("S3 bucket name is required".into()));
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_client_options(ClientOptions::new().with_timeout(S3_REQUEST_TIMEOUT));
        if !cfg.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&cfg.access_key_id)
                .with_secret_access_key(&cfg.secret_access_key);
        }
        if !cfg.endpoint.is_empty() {
            builder = builder
                .with_endpoint(&cfg.endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(cfg.endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        Ok(Self::from_store(
            Arc::new(store),
            format!("s3://{}", cfg.bucket),
        ))
    }

    /// Serve a local directory as if it were a bucket, creating it if needed.
    pub fn local(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::from_store(
            Arc::new(store),
            format!("file://{}", root.display()),
        ))
    }
}

#[async_trait]
impl BucketStorage for StorageService {
    async fn list(&self, prefix: &str) -> StorageResult<Vec<BucketObject>> {
        let prefix = prefix.trim_matches('/');
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));

        let metas: Vec<_> = self.store.list(prefix.as_ref()).try_collect().await?;
        debug!("listed {} objects from {}", metas.len(), self.location);

        Ok(metas
            .into_iter()
            .map(|meta| {
                BucketObject::new(
                    meta.location.to_string(),
                    meta.size as u64,
                    meta.last_modified,
                    meta.e_tag.unwrap_or_default(),
                )
            })
            .collect())
    }

    async fn get(&self, key: &str) -> StorageResult<ObjectBody> {
        let path = object_path(key)?;
        let result = self.store.get(&path).await?;

        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| value.to_string())
            .or_else(|| content_type_for_key(key).map(str::to_string));
        let content_length = result.meta.size as u64;
        let stream = result.into_stream().map_err(io::Error::other).boxed();

        Ok(ObjectBody {
            stream,
            content_type,
            content_length,
        })
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}

/// Basic key validation to avoid trivial path traversal vectors, then
/// conversion into an `object_store` path.
fn object_path(key: &str) -> StorageResult<ObjectPath> {
    let invalid = || StorageError::InvalidKey(key.to_string());
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(invalid());
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(invalid());
    }
    ObjectPath::parse(key).map_err(|_| invalid())
}

/// Content type implied by well-known suffixes, for backends that do not
/// store one.
fn content_type_for_key(key: &str) -> Option<&'static str> {
    if key.ends_with(".json") {
        Some("application/json")
    } else if key.ends_with(".tar.gz") || key.ends_with(".tgz") {
        Some("application/gzip")
    } else if key.ends_with(".txt") || key.ends_with(".log") {
        Some("text/plain; charset=utf-8")
    } else {
        None
    }
}
