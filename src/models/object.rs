//! Represents an object (file) listed from the watched bucket.

use crate::services::sidecar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry of a bucket listing.
///
/// This is an immutable snapshot of the bucket at listing time; two listings
/// only share identity through `key`. The serialized field names are the ones
/// the browser client already consumes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketObject {
    /// Object key (path-like identifier within the bucket).
    #[serde(rename = "Key")]
    pub key: String,

    /// Size in bytes.
    #[serde(rename = "Size")]
    pub size: u64,

    /// Timestamp when the object was last modified.
    #[serde(rename = "LastModified")]
    pub last_modified: DateTime<Utc>,

    /// Opaque entity tag reported by the backend.
    #[serde(rename = "ETag")]
    pub etag: String,

    /// Whether the key carries the `.json` metadata suffix.
    #[serde(rename = "IsMetadata")]
    pub is_metadata: bool,

    /// Whether the key is a snapshot archive (`.tar.gz`).
    #[serde(rename = "IsTarGz")]
    pub is_archive: bool,
}

impl BucketObject {
    /// Build a listing entry, deriving the classification flags from the key.
    pub fn new(
        key: impl Into<String>,
        size: u64,
        last_modified: DateTime<Utc>,
        etag: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let class = sidecar::classify(&key);
        Self {
            key,
            size,
            last_modified,
            etag: etag.into(),
            is_metadata: class.is_metadata,
            is_archive: class.is_archive,
        }
    }

    /// Metadata file named after a snapshot, i.e. worth indexing.
    pub fn is_sidecar(&self) -> bool {
        self.is_metadata && sidecar::is_sidecar(&self.key)
    }
}
