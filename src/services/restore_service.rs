//! Restore orchestration: download one backup object and run the reverse
//! pipeline into a target image.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{Instrument, info, info_span};

use crate::{
    errors::PipelineError,
    models::artifact::{COMPRESSED_SUFFIX, ENCRYPTED_SUFFIX},
    services::{
        ceph::RbdClient,
        compression,
        control::CallControl,
        gpg::{GpgDecryptor, KeyMaterial},
        object_store::{ObjectStore, StorageError},
        scratch::{ScratchFile, ensure_dir, scratch_stamp},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    /// Target and object checks before any data moves.
    Check,
    Download,
    Decrypt,
    Decompress,
    Import,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Check => "check",
            Self::Download => "download",
            Self::Decrypt => "decrypt",
            Self::Decompress => "decompress",
            Self::Import => "import",
        })
    }
}

#[derive(Debug, Error)]
#[error("restore failed during {stage}")]
pub struct RestoreFailure {
    pub stage: RestoreStage,
    #[source]
    pub source: PipelineError,
}

trait AtStage<T> {
    fn at(self, stage: RestoreStage) -> Result<T, RestoreFailure>;
}

impl<T, E: Into<PipelineError>> AtStage<T> for Result<T, E> {
    fn at(self, stage: RestoreStage) -> Result<T, RestoreFailure> {
        self.map_err(|err| RestoreFailure {
            stage,
            source: err.into(),
        })
    }
}

/// What to restore and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub object_name: String,
    pub pool: String,
    pub image: String,
    /// Import even when the target image already exists.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub downloaded_bytes: u64,
    pub imported_bytes: u64,
}

pub struct RestoreService {
    rbd: RbdClient,
    decryptor: GpgDecryptor,
    keys: KeyMaterial,
    store: Arc<dyn ObjectStore>,
    scratch_dir: PathBuf,
    control: CallControl,
}

impl RestoreService {
    pub fn new(
        rbd: RbdClient,
        decryptor: GpgDecryptor,
        keys: KeyMaterial,
        store: Arc<dyn ObjectStore>,
        scratch_dir: impl Into<PathBuf>,
        control: CallControl,
    ) -> Self {
        Self {
            rbd,
            decryptor,
            keys,
            store,
            scratch_dir: scratch_dir.into(),
            control,
        }
    }

    /// `requested -> downloaded -> decrypted -> decompressed -> imported`.
    pub async fn run(&self, request: &RestoreRequest) -> Result<RestoreReport, RestoreFailure> {
        let span = info_span!(
            "restore",
            object = %request.object_name,
            pool = %request.pool,
            image = %request.image
        );
        self.restore(request).instrument(span).await
    }

    async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport, RestoreFailure> {
        let control = &self.control;
        info!(
            "restoring {} to {}/{}",
            request.object_name, request.pool, request.image
        );

        self.check(request).await?;

        ensure_dir(&self.scratch_dir).await.at(RestoreStage::Download)?;
        let downloaded = ScratchFile::new(self.download_path(&request.object_name));
        let downloaded_bytes = self
            .store
            .download(&request.object_name, downloaded.path(), control)
            .await
            .at(RestoreStage::Download)?;

        let (decrypted, _) = self
            .decryptor
            .decrypt(downloaded.path(), &self.keys, control)
            .await
            .at(RestoreStage::Decrypt)?;
        downloaded.release();

        let (raw, imported_bytes) = compression::decompress(decrypted.path(), control)
            .await
            .at(RestoreStage::Decompress)?;
        decrypted.release();

        self.rbd
            .import(&request.pool, &request.image, raw.path(), control)
            .await
            .at(RestoreStage::Import)?;
        raw.release();

        info!(
            "restored {} to {}/{}",
            request.object_name, request.pool, request.image
        );
        Ok(RestoreReport {
            downloaded_bytes,
            imported_bytes,
        })
    }

    async fn check(&self, request: &RestoreRequest) -> Result<(), RestoreFailure> {
        let chain = format!("{COMPRESSED_SUFFIX}{ENCRYPTED_SUFFIX}");
        if !request.object_name.ends_with(&chain) {
            return Err(PipelineError::config(format!(
                "object `{}` is not a backup artifact (expected a `{chain}` name)",
                request.object_name
            )))
            .at(RestoreStage::Check);
        }

        if request.force {
            info!(
                "--force given; not checking whether {}/{} exists",
                request.pool, request.image
            );
        } else if self
            .rbd
            .image_exists(&request.pool, &request.image, &self.control)
            .await
            .at(RestoreStage::Check)?
        {
            return Err(PipelineError::ImageExists {
                pool: request.pool.clone(),
                image: request.image.clone(),
            })
            .at(RestoreStage::Check);
        }

        if !self
            .store
            .exists(&request.object_name, &self.control)
            .await
            .at(RestoreStage::Check)?
        {
            return Err(StorageError::ObjectNotFound {
                bucket: self.store.describe(),
                key: request.object_name.clone(),
            })
            .at(RestoreStage::Check);
        }
        Ok(())
    }

    /// `<scratch>/restore-<stamp>-<file name of the object>`.
    fn download_path(&self, object_name: &str) -> PathBuf {
        let file_name = Path::new(object_name)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| object_name.replace('/', "_"));
        self.scratch_dir
            .join(format!("restore-{}-{file_name}", scratch_stamp()))
    }
}
