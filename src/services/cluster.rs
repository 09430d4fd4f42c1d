//! Read-only access to the Kubernetes control plane.
//!
//! [`KubectlCluster`] shells out to `kubectl get ... -o json`; tests swap in
//! an in-memory implementation of [`ClusterApi`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    config::KubernetesConfig,
    errors::{PipelineError, PipelineResult},
    models::volume::{ClaimRecord, RecordList, VolumeRecord},
    services::{control::CallControl, process::ToolCommand},
};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Every claim in `namespace`, in control-plane order.
    async fn list_claims(&self, namespace: &str, control: &CallControl) -> PipelineResult<Vec<ClaimRecord>>;

    /// The cluster-scoped volume called `name`.
    async fn get_volume(&self, name: &str, control: &CallControl) -> PipelineResult<VolumeRecord>;
}

pub struct KubectlCluster {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlCluster {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            kubectl: config.kubectl_path,
            kubeconfig: config.kubeconfig,
            context: config.context,
        }
    }

    fn command(&self, label: &str) -> ToolCommand {
        ToolCommand::new(&self.kubectl, label)
            .opt_flag("--kubeconfig", self.kubeconfig.as_ref())
            .opt_flag("--context", self.context.as_ref())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        command: ToolCommand,
        operation: &'static str,
        control: &CallControl,
    ) -> PipelineResult<T> {
        let output = command.output(control, operation).await?;
        if !output.status.success() {
            let failure = command.failure(&output);
            return Err(PipelineError::Cluster {
                operation,
                message: failure.to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|err| PipelineError::Cluster {
            operation,
            message: format!("unexpected response: {err}"),
        })
    }
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    async fn list_claims(&self, namespace: &str, control: &CallControl) -> PipelineResult<Vec<ClaimRecord>> {
        let command = self
            .command("kubectl get pvc")
            .arg("get")
            .arg("pvc")
            .arg("--namespace")
            .arg(namespace)
            .arg("-o")
            .arg("json");
        let list: RecordList<ClaimRecord> = self.get_json(command, "list claims", control).await?;
        debug!("found {} claims in namespace {}", list.items.len(), namespace);
        Ok(list.items)
    }

    async fn get_volume(&self, name: &str, control: &CallControl) -> PipelineResult<VolumeRecord> {
        let command = self
            .command("kubectl get pv")
            .arg("get")
            .arg("pv")
            .arg(name)
            .arg("-o")
            .arg("json");
        self.get_json(command, "get volume", control).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{errors::ErrorKind, test_support::write_script};

    fn cluster(kubectl: PathBuf) -> KubectlCluster {
        KubectlCluster::new(KubernetesConfig {
            kubectl_path: kubectl,
            context: Some("prod".into()),
            ..KubernetesConfig::default()
        })
    }

    #[tokio::test]
    async fn lists_claims_from_kubectl_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let args_log = dir.path().join("args");
        let kubectl = write_script(
            dir.path(),
            "kubectl",
            &format!(
                r#"echo "$@" > {log}
cat <<'JSON'
{{"items": [
  {{"metadata": {{"name": "data", "namespace": "apps"}}, "spec": {{"volumeName": "pv-1"}}, "status": {{"phase": "Bound"}}}},
  {{"metadata": {{"name": "scratch", "namespace": "apps"}}, "spec": {{}}, "status": {{"phase": "Pending"}}}}
]}}
JSON
"#,
                log = args_log.display()
            ),
        )?;

        let claims = cluster(kubectl)
            .list_claims("apps", &CallControl::default())
            .await?;

        let names: Vec<&str> = claims.iter().map(ClaimRecord::name).collect();
        assert_eq!(names, vec!["data", "scratch"]);
        assert_eq!(
            std::fs::read_to_string(&args_log)?.trim(),
            "--context prod get pvc --namespace apps -o json"
        );
        Ok(())
    }

    #[tokio::test]
    async fn kubectl_failure_is_a_cluster_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let kubectl = write_script(
            dir.path(),
            "kubectl",
            "echo 'Error from server (NotFound): persistentvolumes \"pv-9\" not found' >&2\nexit 1\n",
        )?;

        let err = cluster(kubectl)
            .get_volume("pv-9", &CallControl::default())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

        assert_eq!(err.kind(), ErrorKind::Cluster);
        assert!(err.to_string().contains("pv-9"));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_output_is_a_cluster_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let kubectl = write_script(dir.path(), "kubectl", "echo 'not json'\n")?;

        let err = cluster(kubectl)
            .list_claims("apps", &CallControl::default())
            .await
            .err();
        assert!(matches!(err, Some(PipelineError::Cluster { operation: "list claims", .. })));
        Ok(())
    }
}
