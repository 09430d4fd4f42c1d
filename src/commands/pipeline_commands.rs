//! `backup` and `restore`.

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    commands::{error_chain, open_store},
    config::AppConfig,
    services::{
        backup_service::{BackupReport, BackupService},
        ceph::RbdClient,
        cluster::KubectlCluster,
        control::CallControl,
        gpg::{GpgDecryptor, GpgEncryptor},
        restore_service::{RestoreRequest, RestoreService},
    },
};

/// Back up every Ceph-backed claim in the configured namespace.
///
/// Exits non-zero when any volume failed, after all volumes were attempted.
pub async fn backup(cfg: AppConfig, control: CallControl) -> Result<ExitCode> {
    let AppConfig {
        namespace,
        kubernetes,
        ceph,
        gpg,
        storage,
        backup,
        ..
    } = cfg;

    let encryptor = GpgEncryptor::new(gpg)?;
    let store = open_store(storage).await?;
    info!("backing up namespace {} to {}", namespace, store.describe());

    let driver_token = kubernetes.driver_token.clone();
    let service = BackupService::new(
        Arc::new(KubectlCluster::new(kubernetes)),
        driver_token,
        RbdClient::new(ceph, backup.temp_dir),
        encryptor,
        store,
        control,
    );
    let report = service
        .run(&namespace)
        .await
        .with_context(|| format!("backing up namespace {namespace}"))?;

    print!("{}", render_backup_report(&report));
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("{} volume(s) failed", report.failed.len());
        Ok(ExitCode::FAILURE)
    }
}

/// Restore one object into `pool/image`.
pub async fn restore(cfg: AppConfig, request: RestoreRequest, control: CallControl) -> Result<ExitCode> {
    let AppConfig {
        ceph,
        gpg,
        storage,
        backup,
        ..
    } = cfg;

    let keys = gpg.key_material();
    let store = open_store(storage).await?;
    let service = RestoreService::new(
        RbdClient::new(ceph, backup.temp_dir.clone()),
        GpgDecryptor::new(gpg.path),
        keys,
        store,
        backup.temp_dir,
        control,
    );

    let report = service.run(&request).await.with_context(|| {
        format!(
            "restoring {} to {}/{}",
            request.object_name, request.pool, request.image
        )
    })?;

    println!(
        "restored {} to {}/{} ({} bytes downloaded, {} bytes imported)",
        request.object_name, request.pool, request.image, report.downloaded_bytes, report.imported_bytes
    );
    Ok(ExitCode::SUCCESS)
}

fn render_backup_report(report: &BackupReport) -> String {
    let mut out = String::new();
    for volume in &report.uploaded {
        out.push_str(&format!(
            "uploaded  {:<24} {} ({} bytes)\n",
            volume.identity.claim_name, volume.object_name, volume.receipt.size_bytes
        ));
    }
    for claim in &report.skipped {
        out.push_str(&format!("skipped   {claim}\n"));
    }
    for failure in &report.failed {
        out.push_str(&format!(
            "failed    {:<24} {} [{:?}]: {}\n",
            failure.claim_name,
            failure.stage,
            failure.error.kind(),
            error_chain(&failure.error)
        ));
    }
    if report.cancelled {
        out.push_str("cancelled before all volumes were processed\n");
    }
    out.push_str(&format!(
        "{} uploaded, {} skipped, {} failed\n",
        report.uploaded.len(),
        report.skipped.len(),
        report.failed.len()
    ));
    out
}
