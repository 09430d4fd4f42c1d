//! Directory-backed object store.
//!
//! Metadata (buckets, objects, user metadata) lives in SQLite under
//! `<root>/.meta/objects.db`; payloads are sharded beneath
//! `<root>/{bucket}/{shard}/{shard}/{key}`. Uploads stream through a temp
//! file and are renamed into place once fully written and synced.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    models::{bucket::Bucket, object::Object},
    services::{
        control::CallControl,
        object_store::{
            ObjectStore, StorageError, StorageResult, UploadAttributes, UploadReceipt,
            validate_bucket_name, validate_object_key,
        },
        scratch::ScratchFile,
    },
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const META_DIR: &str = ".meta";
const DB_FILE: &str = "objects.db";
const LOCAL_REGION: &str = "local";

/// Object store rooted at a local (or mounted network) directory.
#[derive(Clone)]
pub struct LocalStore {
    db: SqlitePool,
    root: PathBuf,
    bucket: String,
}

impl LocalStore {
    /// Open (creating if needed) the store under `root` and apply the schema.
    pub async fn open(root: impl Into<PathBuf>, bucket: impl Into<String>) -> StorageResult<Self> {
        let root = root.into();
        let bucket = bucket.into();
        validate_bucket_name(&bucket)?;

        let meta_dir = root.join(META_DIR);
        fs::create_dir_all(&meta_dir)
            .await
            .map_err(|err| StorageError::io("create store directory", &meta_dir, err))?;

        let options = SqliteConnectOptions::new()
            .filename(meta_dir.join(DB_FILE))
            .create_if_missing(true)
            .foreign_keys(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for stmt in statements {
            sqlx::query(stmt).execute(&db).await?;
        }

        debug!("opened local object store at {}", root.display());
        Ok(Self { db, root, bucket })
    }

    /// Two-level shard directories derived from MD5(bucket/key), `00`–`ff` each.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{bucket}/{key}"));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        self.root.join(&self.bucket).join(shard_a).join(shard_b).join(key)
    }

    async fn find_bucket(&self) -> StorageResult<Option<Bucket>> {
        let bucket = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(&self.bucket)
        .fetch_optional(&self.db)
        .await?;
        Ok(bucket)
    }

    async fn fetch_bucket(&self) -> StorageResult<Bucket> {
        self.find_bucket()
            .await?
            .ok_or_else(|| StorageError::BucketNotFound(self.bucket.clone()))
    }

    /// Return the bucket row, creating it (and its directory) on first use.
    async fn ensure_bucket(&self) -> StorageResult<Bucket> {
        if let Some(bucket) = self.find_bucket().await? {
            return Ok(bucket);
        }

        info!("creating bucket {}", self.bucket);
        let bucket_root = self.root.join(&self.bucket);
        fs::create_dir_all(&bucket_root)
            .await
            .map_err(|err| StorageError::io("create bucket directory", &bucket_root, err))?;

        sqlx::query(
            "INSERT INTO buckets (id, name, region, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(&self.bucket)
        .bind(LOCAL_REGION)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        self.fetch_bucket().await
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, filename, content_type, size_bytes, etag, last_modified
             FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket.id)
        .bind(key)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StorageError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: key.to_string(),
        })
    }

    /// Stored row of an object.
    pub async fn head(&self, key: &str) -> StorageResult<Object> {
        validate_object_key(key)?;
        let bucket = self.fetch_bucket().await?;
        self.fetch_object(&bucket, key).await
    }

    /// Stream a payload into place, computing size and MD5 on the way, then
    /// upsert its row and replace its user metadata.
    async fn store_stream<S>(
        &self,
        key: &str,
        attributes: UploadAttributes,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let bucket = self.ensure_bucket().await?;

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::InvalidObjectKey(key.to_string()))?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::io("create shard directory", &parent, err))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| StorageError::io("create temp payload", &tmp_path, err))?;
        let tmp = ScratchFile::new(tmp_path);

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| StorageError::io("read upload source", tmp.path(), err))?;
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|err| StorageError::io("write temp payload", tmp.path(), err))?;
        }
        file.flush()
            .await
            .map_err(|err| StorageError::io("flush temp payload", tmp.path(), err))?;
        file.sync_all()
            .await
            .map_err(|err| StorageError::io("sync temp payload", tmp.path(), err))?;
        drop(file);

        fs::rename(tmp.path(), &file_path)
            .await
            .map_err(|err| StorageError::io("move payload into place", &file_path, err))?;
        tmp.persist();

        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        let etag = format!("{:x}", digest.compute());

        let mut tx = self.db.begin().await?;
        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, filename, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, filename, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(key)
        .bind(&filename)
        .bind(attributes.content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        for (meta_key, value) in &attributes.metadata {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object.id)
                .bind(*meta_key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(object)
    }

    /// Walk back up from `start`, removing empty directories, stopping at
    /// `stop`, at a non-empty directory, or at any unexpected error.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(()) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn describe(&self) -> String {
        format!("file://{}/{}", self.root.display(), self.bucket)
    }

    async fn upload(
        &self,
        source: &Path,
        object_name: &str,
        control: &CallControl,
    ) -> StorageResult<UploadReceipt> {
        validate_object_key(object_name)?;
        info!("uploading {} as {}", source.display(), object_name);

        let object = control
            .run("upload object", async {
                let file = File::open(source)
                    .await
                    .map_err(|err| StorageError::io("open upload source", source, err))?;
                self.store_stream(object_name, UploadAttributes::for_file(source), ReaderStream::new(file))
                    .await
            })
            .await?;

        info!(
            "uploaded {} to {} (etag {}, {} bytes)",
            object_name,
            self.describe(),
            object.etag,
            object.size_bytes
        );
        Ok(UploadReceipt {
            etag: object.etag,
            size_bytes: object.size_bytes.max(0) as u64,
        })
    }

    async fn download(
        &self,
        object_name: &str,
        destination: &Path,
        control: &CallControl,
    ) -> StorageResult<u64> {
        validate_object_key(object_name)?;
        info!("downloading {} to {}", object_name, destination.display());

        control
            .run("download object", async {
                let object = self.head(object_name).await.map_err(|err| match err {
                    StorageError::BucketNotFound(bucket) => StorageError::ObjectNotFound {
                        bucket,
                        key: object_name.to_string(),
                    },
                    other => other,
                })?;

                let payload = self.object_path(object_name);
                let mut source = File::open(&payload).await.map_err(|err| {
                    if err.kind() == ErrorKind::NotFound {
                        StorageError::ObjectNotFound {
                            bucket: self.bucket.clone(),
                            key: object_name.to_string(),
                        }
                    } else {
                        StorageError::io("open payload", &payload, err)
                    }
                })?;

                let mut out = File::create(destination)
                    .await
                    .map_err(|err| StorageError::io("create download target", destination, err))?;
                let target = ScratchFile::new(destination);
                let copied = tokio::io::copy(&mut source, &mut out)
                    .await
                    .map_err(|err| StorageError::io("write download target", destination, err))?;
                out.flush()
                    .await
                    .map_err(|err| StorageError::io("flush download target", destination, err))?;
                target.persist();

                debug!(
                    "downloaded {} ({} bytes, recorded {})",
                    object_name, copied, object.size_bytes
                );
                Ok::<_, StorageError>(copied)
            })
            .await
    }

    async fn list(&self, prefix: Option<&str>, control: &CallControl) -> StorageResult<Vec<String>> {
        control
            .run("list objects", async {
                let Some(bucket) = self.find_bucket().await? else {
                    return Ok::<_, StorageError>(Vec::new());
                };
                let prefix = prefix.unwrap_or_default();
                let keys = sqlx::query_scalar::<_, String>(
                    "SELECT key FROM objects
                     WHERE bucket_id = ? AND substr(key, 1, length(?)) = ?
                     ORDER BY key",
                )
                .bind(bucket.id)
                .bind(prefix)
                .bind(prefix)
                .fetch_all(&self.db)
                .await?;
                debug!("found {} objects with prefix {:?}", keys.len(), prefix);
                Ok(keys)
            })
            .await
    }

    async fn delete(&self, object_name: &str, control: &CallControl) -> StorageResult<()> {
        validate_object_key(object_name)?;
        control
            .run("delete object", async {
                let bucket = self.fetch_bucket().await?;
                let object = self.fetch_object(&bucket, object_name).await?;

                let mut tx = self.db.begin().await?;
                sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
                    .bind(object.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM objects WHERE id = ?")
                    .bind(object.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                let file_path = self.object_path(object_name);
                match fs::remove_file(&file_path).await {
                    Ok(()) => debug!("removed payload {}", file_path.display()),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!("payload {} already missing", file_path.display());
                    }
                    Err(err) => return Err(StorageError::io("remove payload", &file_path, err)),
                }
                if let Some(parent) = file_path.parent() {
                    self.prune_empty_dirs(parent, &self.root.join(&self.bucket)).await;
                }
                info!("deleted {} from {}", object_name, self.describe());
                Ok(())
            })
            .await
    }

    async fn exists(&self, object_name: &str, control: &CallControl) -> StorageResult<bool> {
        validate_object_key(object_name)?;
        control
            .run("stat object", async {
                match self.head(object_name).await {
                    Ok(_) => Ok(true),
                    Err(StorageError::ObjectNotFound { .. } | StorageError::BucketNotFound(_)) => {
                        Ok(false)
                    }
                    Err(err) => Err(err),
                }
            })
            .await
    }
}
