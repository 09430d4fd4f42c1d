//! `validate`: readiness checks for every dependency of a backup run.
//!
//! - cluster -> list claims in the namespace
//! - rbd     -> `rbd --version`, or `rbd ls <pool>` with `--pool`
//! - gpg     -> recipient configured and present in the keyring
//! - storage -> list the bucket

use std::{process::ExitCode, sync::Arc};

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info};

use crate::{
    commands::{error_chain, open_store},
    config::AppConfig,
    errors::{PipelineError, PipelineResult},
    services::{
        ceph::RbdClient,
        cluster::{ClusterApi, KubectlCluster},
        control::CallControl,
        gpg::GpgEncryptor,
        object_store::ObjectStore,
    },
};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CheckStatus {
    pub name: &'static str,
    pub ok: bool,
    /// What was verified, or why the check failed.
    pub detail: String,
}

impl CheckStatus {
    fn from_result(name: &'static str, result: PipelineResult<String>) -> Self {
        match result {
            Ok(detail) => Self {
                name,
                ok: true,
                detail,
            },
            Err(err) => Self {
                name,
                ok: false,
                detail: error_chain(&err),
            },
        }
    }
}

/// Components under test. Construction errors are carried into the check
/// they belong to rather than aborting the whole run.
pub struct Dependencies<'a> {
    pub namespace: &'a str,
    pub cluster: &'a dyn ClusterApi,
    pub rbd: &'a RbdClient,
    pub pool: Option<&'a str>,
    pub encryptor: PipelineResult<GpgEncryptor>,
    pub store: PipelineResult<Arc<dyn ObjectStore>>,
}

pub async fn validate(cfg: AppConfig, pool: Option<String>, control: CallControl) -> Result<ExitCode> {
    let AppConfig {
        namespace,
        kubernetes,
        ceph,
        gpg,
        storage,
        backup,
        ..
    } = cfg;
    info!("validating configuration and dependencies");

    let cluster = KubectlCluster::new(kubernetes);
    let rbd = RbdClient::new(ceph, backup.temp_dir);
    let deps = Dependencies {
        namespace: &namespace,
        cluster: &cluster,
        rbd: &rbd,
        pool: pool.as_deref(),
        encryptor: GpgEncryptor::new(gpg),
        store: open_store(storage).await,
    };

    let checks = run_checks(deps, &control).await;
    print!("{}", render_checks(&checks));

    let failed = checks.iter().filter(|check| !check.ok).count();
    if failed == 0 {
        info!("all validations passed");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("validation failed with {} error(s)", failed);
        Ok(ExitCode::FAILURE)
    }
}

pub async fn run_checks(deps: Dependencies<'_>, control: &CallControl) -> Vec<CheckStatus> {
    let cluster = async {
        let claims = deps.cluster.list_claims(deps.namespace, control).await?;
        Ok::<_, PipelineError>(format!("{} claims in namespace {}", claims.len(), deps.namespace))
    };
    let cluster = CheckStatus::from_result("cluster", cluster.await);

    let rbd = async {
        match deps.pool {
            Some(pool) => {
                let images = deps.rbd.list_images(pool, control).await?;
                Ok::<_, PipelineError>(format!("{} images in pool {}", images.len(), pool))
            }
            None => deps.rbd.version(control).await,
        }
    };
    let rbd = CheckStatus::from_result("rbd", rbd.await);

    let gpg = async {
        let encryptor = deps.encryptor?;
        encryptor.validate_recipient(control).await?;
        Ok::<_, PipelineError>(format!("recipient {} found", encryptor.recipient()))
    };
    let gpg = CheckStatus::from_result("gpg", gpg.await);

    let storage = async {
        let store = deps.store?;
        let keys = store.list(None, control).await?;
        Ok::<_, PipelineError>(format!("{} objects in {}", keys.len(), store.describe()))
    };
    let storage = CheckStatus::from_result("storage", storage.await);

    vec![cluster, rbd, gpg, storage]
}

fn render_checks(checks: &[CheckStatus]) -> String {
    let mut out = String::new();
    for check in checks {
        let mark = if check.ok { "ok  " } else { "FAIL" };
        out.push_str(&format!("[{mark}] {:<8} {}\n", check.name, check.detail));
    }
    let failed = checks.iter().filter(|check| !check.ok).count();
    if failed == 0 {
        out.push_str("\nValidation completed successfully. The tool is ready to use.\n");
    } else {
        out.push_str(&format!(
            "\nValidation completed with {failed} error(s). Please fix the issues above.\n"
        ));
    }
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        config::{CephConfig, GpgConfig},
        services::local_store::LocalStore,
        test_support::{FAKE_GPG, FAKE_RBD, FakeCluster, bound_claim, write_script},
    };

    #[tokio::test]
    async fn healthy_dependencies_pass_every_check() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd_path = write_script(dir.path(), "rbd", FAKE_RBD)?;
        let gpg_path = write_script(dir.path(), "gpg", FAKE_GPG)?;
        let cluster = FakeCluster::new(vec![bound_claim("data", "pv-1")], vec![]);
        let rbd = RbdClient::new(
            CephConfig {
                rbd_path,
                ..CephConfig::default()
            },
            dir.path().join("scratch"),
        );
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::open(dir.path().join("store"), "ceph-backups").await?);

        let checks = run_checks(
            Dependencies {
                namespace: "apps",
                cluster: &cluster,
                rbd: &rbd,
                pool: Some("rbd"),
                encryptor: GpgEncryptor::new(GpgConfig {
                    path: gpg_path,
                    recipient: Some("ops@example.com".into()),
                    ..GpgConfig::default()
                }),
                store: Ok(store),
            },
            &CallControl::default(),
        )
        .await;

        let details: Vec<(&str, bool, &str)> = checks
            .iter()
            .map(|check| (check.name, check.ok, check.detail.as_str()))
            .collect();
        assert_eq!(details[0], ("cluster", true, "1 claims in namespace apps"));
        assert_eq!(details[1], ("rbd", true, "2 images in pool rbd"));
        assert_eq!(details[2], ("gpg", true, "recipient ops@example.com found"));
        assert_eq!(details[3].0, "storage");
        assert!(details[3].1);
        assert!(render_checks(&checks).ends_with("The tool is ready to use.\n"));
        Ok(())
    }

    #[tokio::test]
    async fn each_failure_is_reported_independently() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd_path = write_script(dir.path(), "rbd", FAKE_RBD)?;
        let cluster = FakeCluster::default();
        let rbd = RbdClient::new(
            CephConfig {
                rbd_path,
                ..CephConfig::default()
            },
            dir.path().join("scratch"),
        );

        let checks = run_checks(
            Dependencies {
                namespace: "apps",
                cluster: &cluster,
                rbd: &rbd,
                pool: None,
                encryptor: GpgEncryptor::new(GpgConfig::default()),
                store: Err(PipelineError::config("storage.endpoint is not configured")),
            },
            &CallControl::default(),
        )
        .await;

        let ok: Vec<bool> = checks.iter().map(|check| check.ok).collect();
        assert_eq!(ok, vec![true, true, false, false]);
        assert_eq!(checks[1].detail, "rbd version 18.2.0 (fake)");
        assert_eq!(checks[2].detail, "configuration error: gpg.recipient is not configured");
        assert!(render_checks(&checks).contains("completed with 2 error(s)"));
        Ok(())
    }
}
