//! Backup orchestration: discover claims, then export, compress, encrypt and
//! upload each resolved volume in turn.
//!
//! A failing volume is logged and recorded; the run moves on to the next one.
//! Intermediate files are released as soon as the following stage has
//! consumed them, and on every failure path when their guards drop.

use std::{fmt, sync::Arc};

use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{artifact::BackupObjectName, volume::VolumeIdentity},
    services::{
        ceph::RbdClient,
        cluster::ClusterApi,
        compression,
        control::CallControl,
        gpg::GpgEncryptor,
        object_store::{ObjectStore, UploadReceipt},
        resolver::VolumeResolver,
    },
};

/// Stage a volume's pipeline was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Resolve,
    Export,
    Compress,
    Encrypt,
    Upload,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "resolve",
            Self::Export => "export",
            Self::Compress => "compress",
            Self::Encrypt => "encrypt",
            Self::Upload => "upload",
        })
    }
}

#[derive(Debug)]
pub struct UploadedVolume {
    pub identity: VolumeIdentity,
    pub object_name: String,
    pub receipt: UploadReceipt,
}

#[derive(Debug)]
pub struct FailedVolume {
    pub claim_name: String,
    pub stage: BackupStage,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct BackupReport {
    pub uploaded: Vec<UploadedVolume>,
    /// Claims that are unbound or not served by the Ceph driver.
    pub skipped: Vec<String>,
    pub failed: Vec<FailedVolume>,
    /// Set when the run stopped early because the token was cancelled.
    pub cancelled: bool,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

pub struct BackupService {
    cluster: Arc<dyn ClusterApi>,
    resolver: VolumeResolver,
    rbd: RbdClient,
    encryptor: GpgEncryptor,
    store: Arc<dyn ObjectStore>,
    control: CallControl,
}

impl BackupService {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        driver_token: impl Into<String>,
        rbd: RbdClient,
        encryptor: GpgEncryptor,
        store: Arc<dyn ObjectStore>,
        control: CallControl,
    ) -> Self {
        Self {
            resolver: VolumeResolver::new(cluster.clone(), driver_token),
            cluster,
            rbd,
            encryptor,
            store,
            control,
        }
    }

    /// Back up every applicable claim in `namespace`. Only listing the claims
    /// can fail the run as a whole.
    pub async fn run(&self, namespace: &str) -> PipelineResult<BackupReport> {
        info!("starting backup for namespace {}", namespace);
        let claims = self.cluster.list_claims(namespace, &self.control).await?;
        info!("found {} claims in namespace {}", claims.len(), namespace);

        let mut report = BackupReport::default();
        let mut volumes = Vec::new();
        for claim in &claims {
            match self.resolver.resolve(claim, &self.control).await {
                Ok(Some(identity)) => volumes.push(identity),
                Ok(None) => report.skipped.push(claim.name().to_string()),
                Err(err) => {
                    error!("failed to resolve claim {}: {}", claim.name(), err);
                    report.failed.push(FailedVolume {
                        claim_name: claim.name().to_string(),
                        stage: BackupStage::Resolve,
                        error: err,
                    });
                    if self.control.is_cancelled() {
                        report.cancelled = true;
                        return Ok(report);
                    }
                }
            }
        }
        info!("found {} Ceph-backed claims to back up", volumes.len());

        for identity in volumes {
            let span = info_span!(
                "volume",
                claim = %identity.claim_name,
                pool = %identity.pool,
                image = %identity.image
            );
            match self.backup_volume(&identity).instrument(span).await {
                Ok((object_name, receipt)) => report.uploaded.push(UploadedVolume {
                    identity,
                    object_name,
                    receipt,
                }),
                Err((stage, err)) => {
                    error!("failed to back up {} during {}: {}", identity, stage, err);
                    report.failed.push(FailedVolume {
                        claim_name: identity.claim_name,
                        stage,
                        error: err,
                    });
                    if self.control.is_cancelled() {
                        warn!("backup cancelled; remaining volumes were not attempted");
                        report.cancelled = true;
                        break;
                    }
                }
            }
        }

        info!(
            "backup finished: {} uploaded, {} skipped, {} failed",
            report.uploaded.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// `discovered -> exported -> compressed -> encrypted -> uploaded`.
    async fn backup_volume(
        &self,
        identity: &VolumeIdentity,
    ) -> Result<(String, UploadReceipt), (BackupStage, PipelineError)> {
        info!("starting backup of {}", identity);
        let control = &self.control;

        let (raw, _) = self
            .rbd
            .export(&identity.pool, &identity.image, control)
            .await
            .map_err(|err| (BackupStage::Export, err))?;

        let (compressed, _) = compression::compress(raw.path(), control)
            .await
            .map_err(|err| (BackupStage::Compress, err))?;
        raw.release();

        let (encrypted, _) = self
            .encryptor
            .encrypt(compressed.path(), control)
            .await
            .map_err(|err| (BackupStage::Encrypt, err))?;
        compressed.release();

        let name = BackupObjectName::new(&identity.claim_name, &identity.pool, &identity.image);
        if name.is_lossy() {
            warn!(
                "object name {} cannot be split back into claim, pool and image unambiguously",
                name
            );
        }
        let object_name = name.encode();

        let uploaded = self.store.upload(encrypted.path(), &object_name, control).await;
        encrypted.release();
        let receipt = uploaded.map_err(|err| (BackupStage::Upload, PipelineError::from(err)))?;

        info!("backed up {} to {}", identity, object_name);
        Ok((object_name, receipt))
    }
}
