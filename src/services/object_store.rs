//! Object store gateway: the seam between the pipeline and durable storage.
//!
//! Two implementations exist: [`S3Store`](super::s3_store::S3Store) for
//! S3-compatible services such as MinIO, and
//! [`LocalStore`](super::local_store::LocalStore) for a directory target.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{models::artifact::content_type_for, services::control::CallControl};

use super::control::Interrupted;

/// Value of the `backup-tool` user metadata field.
pub const TOOL_NAME: &str = "ceph-pvc-backup";
pub const META_ORIGINAL_FILENAME: &str = "original-filename";
pub const META_BACKUP_TOOL: &str = "backup-tool";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: &'static str },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("{operation} failed: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} failed for {}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Remote {
            operation,
            message: message.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// What the store reported back for a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub etag: String,
    pub size_bytes: u64,
}

/// Content type and user metadata recorded with every upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttributes {
    pub content_type: &'static str,
    pub metadata: Vec<(&'static str, String)>,
}

impl UploadAttributes {
    pub fn for_file(source: &Path) -> Self {
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            content_type: content_type_for(&file_name),
            metadata: vec![
                (META_ORIGINAL_FILENAME, file_name),
                (META_BACKUP_TOOL, TOOL_NAME.to_string()),
            ],
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://minio:9000/backups`.
    fn describe(&self) -> String;

    /// Upload the whole file, creating the bucket on first use.
    async fn upload(
        &self,
        source: &Path,
        object_name: &str,
        control: &CallControl,
    ) -> StorageResult<UploadReceipt>;

    /// Write the object to `destination`, returning its size in bytes.
    async fn download(
        &self,
        object_name: &str,
        destination: &Path,
        control: &CallControl,
    ) -> StorageResult<u64>;

    /// Every key under `prefix`, recursively, in store order.
    async fn list(&self, prefix: Option<&str>, control: &CallControl) -> StorageResult<Vec<String>>;

    async fn delete(&self, object_name: &str, control: &CallControl) -> StorageResult<()>;

    async fn exists(&self, object_name: &str, control: &CallControl) -> StorageResult<bool>;
}

/// Reject keys that could escape the store root or confuse S3 clients.
pub fn validate_object_key(key: &str) -> StorageResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    Ok(())
}

/// S3 bucket naming rules: 3–63 chars of lowercase letters, digits, dots and
/// hyphens, alphanumeric at both ends, no `..`/`.-`/`-.`, not an IPv4 address.
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let reject = |reason| {
        Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason,
        })
    };

    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
        return reject("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return reject("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return reject("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return reject("cannot contain consecutive dots or dot-hyphen combinations");
    }
    if is_ipv4_like(name) {
        return reject("must not be formatted like an IP address");
    }
    Ok(())
}

fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4 && parts.iter().all(|segment| segment.parse::<u8>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_follow_s3_rules() {
        assert!(validate_bucket_name("ceph-backups").is_ok());
        assert!(validate_bucket_name("backups.2026").is_ok());
        for bad in ["ab", "Backups", "-backups", "backups.", "a..b", "a.-b", "10.0.0.1", "snake_case"] {
            assert!(
                matches!(validate_bucket_name(bad), Err(StorageError::InvalidBucketName { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn object_keys_cannot_escape_root() {
        assert!(validate_object_key("data-rbd-img1.rbd.gz.gpg").is_ok());
        assert!(validate_object_key("nightly/data-rbd-img1.rbd.gz.gpg").is_ok());
        for bad in ["", "/abs", "../up", "a\\b", "tab\there"] {
            assert!(validate_object_key(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn upload_attributes_record_file_name_and_tool() {
        let attrs = UploadAttributes::for_file(Path::new("/tmp/x/rbd-img1-20260101.rbd.gz.gpg"));
        assert_eq!(attrs.content_type, "application/pgp-encrypted");
        assert_eq!(
            attrs.metadata,
            vec![
                (META_ORIGINAL_FILENAME, "rbd-img1-20260101.rbd.gz.gpg".to_string()),
                (META_BACKUP_TOOL, TOOL_NAME.to_string()),
            ]
        );
    }
}
