//! Maps a bound claim to the Ceph pool and image behind it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    errors::{PipelineError, PipelineResult},
    models::volume::{ClaimRecord, VolumeIdentity},
    services::{cluster::ClusterApi, control::CallControl},
};

pub const POOL_ATTRIBUTE: &str = "pool";
pub const IMAGE_ATTRIBUTE: &str = "imageName";

pub struct VolumeResolver {
    cluster: Arc<dyn ClusterApi>,
    driver_token: String,
}

impl VolumeResolver {
    pub fn new(cluster: Arc<dyn ClusterApi>, driver_token: impl Into<String>) -> Self {
        Self {
            cluster,
            driver_token: driver_token.into(),
        }
    }

    /// Resolve one claim.
    ///
    /// `Ok(None)` means the claim is not applicable: unbound, or backed by a
    /// volume that is not served by the configured CSI driver.
    pub async fn resolve(
        &self,
        claim: &ClaimRecord,
        control: &CallControl,
    ) -> PipelineResult<Option<VolumeIdentity>> {
        let Some(volume_name) = claim.bound_volume().filter(|_| claim.is_bound()) else {
            warn!(
                "skipping claim {}: not bound (phase {})",
                claim.name(),
                claim.status.phase.as_deref().unwrap_or("unknown")
            );
            return Ok(None);
        };

        let volume = self.cluster.get_volume(volume_name, control).await?;

        let Some(csi) = volume.spec.csi.as_ref() else {
            debug!("skipping claim {}: volume {} has no CSI source", claim.name(), volume_name);
            return Ok(None);
        };
        if !csi.driver.contains(&self.driver_token) {
            debug!(
                "skipping claim {}: driver {} does not match {}",
                claim.name(),
                csi.driver,
                self.driver_token
            );
            return Ok(None);
        }

        let reported_name = Some(volume.metadata.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(volume_name);
        let attribute = |key: &str| {
            csi.volume_attributes
                .as_ref()
                .and_then(|attrs| attrs.get(key))
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| PipelineError::MissingAttribute {
                    volume: reported_name.to_string(),
                    attribute: key.to_string(),
                })
        };
        let pool = attribute(POOL_ATTRIBUTE)?;
        let image = attribute(IMAGE_ATTRIBUTE)?;

        debug!(
            namespace = claim.metadata.namespace.as_deref().unwrap_or_default(),
            handle = csi.volume_handle.as_deref().unwrap_or_default(),
            "resolved claim {} to {}/{}",
            claim.name(),
            pool,
            image
        );
        Ok(Some(VolumeIdentity {
            pool,
            image,
            claim_name: claim.name().to_string(),
            volume_name: volume_name.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ErrorKind,
        models::volume::{VolumeRecord, VolumeSpec},
        test_support::{FakeCluster, bound_claim, ceph_volume, claim, csi_volume},
    };

    fn resolver(cluster: &Arc<FakeCluster>) -> VolumeResolver {
        VolumeResolver::new(cluster.clone(), "ceph")
    }

    #[tokio::test]
    async fn bound_ceph_claim_resolves() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::new(vec![], vec![ceph_volume("pv-1", "rbd", "img1")]));

        let identity = resolver(&cluster)
            .resolve(&bound_claim("data", "pv-1"), &CallControl::default())
            .await?;

        assert_eq!(
            identity,
            Some(VolumeIdentity {
                pool: "rbd".into(),
                image: "img1".into(),
                claim_name: "data".into(),
                volume_name: "pv-1".into(),
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn pending_claim_is_skipped_without_a_lookup() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::default());

        let identity = resolver(&cluster)
            .resolve(&claim("scratch", "Pending", None), &CallControl::default())
            .await?;

        assert_eq!(identity, None);
        assert!(cluster.fetched().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn bound_claim_without_volume_name_is_skipped() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::default());
        let identity = resolver(&cluster)
            .resolve(&claim("odd", "Bound", Some("")), &CallControl::default())
            .await?;
        assert_eq!(identity, None);
        assert!(cluster.fetched().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn foreign_driver_is_not_applicable() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::new(
            vec![],
            vec![csi_volume("pv-2", "ebs.csi.aws.com", &[("pool", "x"), ("imageName", "y")])],
        ));
        let identity = resolver(&cluster)
            .resolve(&bound_claim("web", "pv-2"), &CallControl::default())
            .await?;
        assert_eq!(identity, None);
        assert_eq!(cluster.fetched(), vec!["pv-2"]);
        Ok(())
    }

    #[tokio::test]
    async fn volume_without_csi_is_not_applicable() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::new(
            vec![],
            vec![VolumeRecord {
                metadata: crate::models::volume::ObjectMeta {
                    name: "pv-host".into(),
                    namespace: None,
                },
                spec: VolumeSpec { csi: None },
            }],
        ));
        let identity = resolver(&cluster)
            .resolve(&bound_claim("logs", "pv-host"), &CallControl::default())
            .await?;
        assert_eq!(identity, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_image_attribute_is_an_error_naming_the_key() -> anyhow::Result<()> {
        let cluster = Arc::new(FakeCluster::new(
            vec![],
            vec![csi_volume("pv-3", "rbd.csi.ceph.com", &[("pool", "rbd")])],
        ));

        let err = resolver(&cluster)
            .resolve(&bound_claim("db", "pv-3"), &CallControl::default())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

        assert_eq!(err.kind(), ErrorKind::Cluster);
        assert!(matches!(
            err,
            PipelineError::MissingAttribute { ref volume, ref attribute }
                if volume == "pv-3" && attribute == IMAGE_ATTRIBUTE
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_attribute_map_reports_pool_first() -> anyhow::Result<()> {
        let mut volume = ceph_volume("pv-4", "rbd", "img");
        if let Some(csi) = volume.spec.csi.as_mut() {
            csi.volume_attributes = None;
        }
        let cluster = Arc::new(FakeCluster::new(vec![], vec![volume]));

        let err = resolver(&cluster)
            .resolve(&bound_claim("db", "pv-4"), &CallControl::default())
            .await
            .err();
        assert!(matches!(
            err,
            Some(PipelineError::MissingAttribute { attribute, .. }) if attribute == POOL_ATTRIBUTE
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unnamed_volume_record_falls_back_to_bound_name() -> anyhow::Result<()> {
        let mut cluster = FakeCluster::default();
        cluster.volumes.insert(
            "pv-5".into(),
            csi_volume("", "rbd.csi.ceph.com", &[("imageName", "img5")]),
        );
        let cluster = Arc::new(cluster);

        let err = resolver(&cluster)
            .resolve(&bound_claim("db", "pv-5"), &CallControl::default())
            .await
            .err();
        assert!(matches!(
            err,
            Some(PipelineError::MissingAttribute { ref volume, ref attribute })
                if volume == "pv-5" && attribute == POOL_ATTRIBUTE
        ));
        Ok(())
    }

    #[tokio::test]
    async fn volume_lookup_failure_propagates() {
        let cluster = Arc::new(FakeCluster::default());
        let result = resolver(&cluster)
            .resolve(&bound_claim("gone", "pv-missing"), &CallControl::default())
            .await;
        assert!(matches!(result, Err(PipelineError::Cluster { .. })));
    }
}
