//! Fixtures shared by unit tests.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    errors::{PipelineError, PipelineResult},
    models::volume::{ClaimRecord, ClaimSpec, ClaimStatus, CsiSource, ObjectMeta, VolumeRecord, VolumeSpec},
    services::{cluster::ClusterApi, control::CallControl},
};

/// Fake `rbd`. `export` writes `image <pool/image>` into the target and
/// fails for `rbd/broken`; `import` copies its source next to the script as
/// `imported-<pool>_<image>`; `info` knows only `rbd/present` (and denies
/// `rbd/locked`); `ls` prints two images and `--version` one line.
pub const FAKE_RBD: &str = r#"
while [ "$1" = "--conf" ] || [ "$1" = "--keyring" ]; do shift 2; done
case "$1" in
  export)
    if [ "$2" = "rbd/broken" ]; then echo "partial" > "$3"; echo "rbd: export error" >&2; exit 1; fi
    printf 'image %s' "$2" > "$3" ;;
  import) cp "$2" "$(dirname "$0")/imported-$(echo "$3" | tr / _)" ;;
  info)
    if [ "$2" = "rbd/present" ]; then exit 0; fi
    if [ "$2" = "rbd/locked" ]; then echo "permission denied" >&2; exit 13; fi
    echo "rbd: error opening image: (2) No such file or directory" >&2; exit 2 ;;
  ls) printf 'img1\n\nimg2\n' ;;
  --version) echo "rbd version 18.2.0 (fake)" ;;
esac
"#;

/// Fake `gpg`. Logs its arguments to `gpg.args` next to the script,
/// "encrypts" by prefixing an armor line and "decrypts" by dropping it.
/// Only `ops@example.com` passes `--list-keys`.
pub const FAKE_GPG: &str = r#"
echo "$@" >> "$(dirname "$0")/gpg.args"
out=""; mode=""; last=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift ;;
    --encrypt) mode=encrypt ;;
    --decrypt) mode=decrypt ;;
    --list-keys) mode=list ;;
  esac
  last="$1"; shift
done
case "$mode" in
  encrypt) { echo "-----BEGIN PGP MESSAGE-----"; cat "$last"; } > "$out" ;;
  decrypt)
    if ! head -n 1 "$last" | grep -q "BEGIN PGP MESSAGE"; then echo "gpg: no valid OpenPGP data found." >&2; exit 2; fi
    tail -n +2 "$last" > "$out" ;;
  list) [ "$last" = "ops@example.com" ] || { echo "gpg: error reading key: No public key" >&2; exit 2; } ;;
esac
"#;

/// Write an executable `/bin/sh` script standing in for an external tool.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

pub fn claim(name: &str, phase: &str, volume: Option<&str>) -> ClaimRecord {
    ClaimRecord {
        metadata: ObjectMeta {
            name: name.into(),
            namespace: Some("default".into()),
        },
        spec: ClaimSpec {
            volume_name: volume.map(str::to_string),
        },
        status: ClaimStatus {
            phase: Some(phase.into()),
        },
    }
}

pub fn bound_claim(name: &str, volume: &str) -> ClaimRecord {
    claim(name, "Bound", Some(volume))
}

/// A volume with a CSI source and the given attributes.
pub fn csi_volume(name: &str, driver: &str, attributes: &[(&str, &str)]) -> VolumeRecord {
    VolumeRecord {
        metadata: ObjectMeta {
            name: name.into(),
            namespace: None,
        },
        spec: VolumeSpec {
            csi: Some(CsiSource {
                driver: driver.into(),
                volume_handle: Some(format!("0001-{name}")),
                volume_attributes: Some(
                    attributes
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            }),
        },
    }
}

pub fn ceph_volume(name: &str, pool: &str, image: &str) -> VolumeRecord {
    csi_volume(name, "rbd.csi.ceph.com", &[("pool", pool), ("imageName", image)])
}

/// In-memory control plane that records which volumes were fetched.
#[derive(Default)]
pub struct FakeCluster {
    pub claims: Vec<ClaimRecord>,
    pub volumes: HashMap<String, VolumeRecord>,
    pub fetched: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new(claims: Vec<ClaimRecord>, volumes: Vec<VolumeRecord>) -> Self {
        Self {
            claims,
            volumes: volumes
                .into_iter()
                .map(|volume| (volume.metadata.name.clone(), volume))
                .collect(),
            fetched: Mutex::default(),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|names| names.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_claims(&self, _namespace: &str, control: &CallControl) -> PipelineResult<Vec<ClaimRecord>> {
        control.check("list claims")?;
        Ok(self.claims.clone())
    }

    async fn get_volume(&self, name: &str, control: &CallControl) -> PipelineResult<VolumeRecord> {
        control.check("get volume")?;
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(name.to_string());
        }
        self.volumes.get(name).cloned().ok_or_else(|| PipelineError::Cluster {
            operation: "get volume",
            message: format!("persistentvolumes \"{name}\" not found"),
        })
    }
}
