//! A bucket row of the directory-backed object store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Top-level container for stored artifacts.
///
/// Created lazily by the first upload that targets it.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,

    /// S3-style bucket name; also the directory name under the store root.
    pub name: String,

    pub region: String,

    pub created_at: DateTime<Utc>,
}
