//! Cluster-side records and the backend identity resolved from them.
//!
//! The claim and volume structs mirror the subset of the Kubernetes
//! `PersistentVolumeClaim` / `PersistentVolume` JSON the resolver reads.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Phase string of a claim that has been bound to a volume.
pub const CLAIM_BOUND: &str = "Bound";

/// One backend block image bound to exactly one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeIdentity {
    pub pool: String,
    pub image: String,
    pub claim_name: String,
    pub volume_name: String,
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (claim {})", self.pool, self.image, self.claim_name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A `PersistentVolumeClaim` as returned by the control plane.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimRecord {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    #[serde(default)]
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimStatus {
    #[serde(default)]
    pub phase: Option<String>,
}

impl ClaimRecord {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_bound(&self) -> bool {
        self.status.phase.as_deref() == Some(CLAIM_BOUND)
    }

    /// Name of the bound volume, treating an empty string as absent.
    pub fn bound_volume(&self) -> Option<&str> {
        self.spec.volume_name.as_deref().filter(|name| !name.is_empty())
    }
}

/// A `PersistentVolume` as returned by the control plane.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeRecord {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VolumeSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeSpec {
    #[serde(default)]
    pub csi: Option<CsiSource>,
}

/// Network-attached storage descriptor of a volume.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiSource {
    pub driver: String,
    #[serde(default)]
    pub volume_handle: Option<String>,
    #[serde(default)]
    pub volume_attributes: Option<HashMap<String, String>>,
}

/// `kubectl get ... -o json` list envelope.
#[derive(Debug, Deserialize)]
pub struct RecordList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}
