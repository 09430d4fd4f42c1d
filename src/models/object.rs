//! An object (artifact) row of the directory-backed object store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata of a stored artifact; the payload lives on disk.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,

    pub bucket_id: Uuid,

    /// Object key, e.g. `data-rbd-img1.rbd.gz.gpg`.
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    pub content_type: Option<String>,

    pub size_bytes: i64,

    /// Hex MD5 of the payload, computed while streaming it in.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
}
