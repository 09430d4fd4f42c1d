//! `rbd` CLI wrapper: export, import, existence check and listing.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    config::CephConfig,
    errors::{PipelineError, PipelineResult},
    models::artifact::RAW_SUFFIX,
    services::{
        control::CallControl,
        process::ToolCommand,
        scratch::{ScratchFile, ensure_dir, scratch_stamp},
    },
};

/// `rbd info` exit status for a missing image (ENOENT).
const RBD_NOT_FOUND: i32 = 2;

pub struct RbdClient {
    rbd: PathBuf,
    config_path: Option<PathBuf>,
    keyring_path: Option<PathBuf>,
    scratch_dir: PathBuf,
}

impl RbdClient {
    pub fn new(config: CephConfig, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            rbd: config.rbd_path,
            config_path: config.config_path,
            keyring_path: config.keyring_path,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn command(&self, label: &str) -> ToolCommand {
        ToolCommand::new(&self.rbd, label)
            .opt_flag("--conf", self.config_path.as_ref())
            .opt_flag("--keyring", self.keyring_path.as_ref())
    }

    /// Export `pool/image` to a fresh scratch file. Returns the file and its size.
    pub async fn export(
        &self,
        pool: &str,
        image: &str,
        control: &CallControl,
    ) -> PipelineResult<(ScratchFile, u64)> {
        ensure_dir(&self.scratch_dir).await?;
        let target = ScratchFile::new(
            self.scratch_dir
                .join(format!("{pool}-{image}-{}{RAW_SUFFIX}", scratch_stamp())),
        );
        info!("exporting {}/{} to {}", pool, image, target.path().display());

        self.command("rbd export")
            .arg("export")
            .arg(format!("{pool}/{image}"))
            .arg(target.path())
            .run(control, "rbd export")
            .await?;

        let size = tokio::fs::metadata(target.path())
            .await
            .map_err(|err| PipelineError::io("stat export", target.path(), err))?
            .len();
        info!("exported {}/{} ({} bytes)", pool, image, size);
        Ok((target, size))
    }

    /// Import `source` as `pool/image`. Does not check for an existing image.
    pub async fn import(
        &self,
        pool: &str,
        image: &str,
        source: &Path,
        control: &CallControl,
    ) -> PipelineResult<()> {
        info!("importing {} to {}/{}", source.display(), pool, image);
        self.command("rbd import")
            .arg("import")
            .arg(source)
            .arg(format!("{pool}/{image}"))
            .run(control, "rbd import")
            .await?;
        info!("imported {}/{}", pool, image);
        Ok(())
    }

    pub async fn image_exists(&self, pool: &str, image: &str, control: &CallControl) -> PipelineResult<bool> {
        let command = self
            .command("rbd info")
            .arg("info")
            .arg(format!("{pool}/{image}"));
        let output = command.output(control, "rbd info").await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(RBD_NOT_FOUND) => {
                debug!("image {}/{} does not exist", pool, image);
                Ok(false)
            }
            _ => Err(command.failure(&output)),
        }
    }

    /// First line of `rbd --version`; proves the binary runs.
    pub async fn version(&self, control: &CallControl) -> PipelineResult<String> {
        let output = self
            .command("rbd --version")
            .arg("--version")
            .run(control, "rbd version")
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    /// Image names in `pool`, one per line of `rbd ls`.
    pub async fn list_images(&self, pool: &str, control: &CallControl) -> PipelineResult<Vec<String>> {
        let output = self
            .command("rbd ls")
            .arg("ls")
            .arg(pool)
            .run(control, "rbd ls")
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        errors::ErrorKind,
        test_support::{FAKE_RBD, write_script},
    };

    fn client(dir: &Path) -> anyhow::Result<RbdClient> {
        let rbd = write_script(dir, "rbd", FAKE_RBD)?;
        Ok(RbdClient::new(
            CephConfig {
                rbd_path: rbd,
                config_path: Some(dir.join("ceph.conf")),
                keyring_path: None,
            },
            dir.join("scratch"),
        ))
    }

    #[tokio::test]
    async fn export_creates_scratch_file_named_after_the_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;

        let (file, size) = rbd.export("rbd", "img1", &CallControl::default()).await?;

        let name = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(name.starts_with("rbd-img1-") && name.ends_with(".rbd"), "{name}");
        assert_eq!(size, "image rbd/img1".len() as u64);
        assert_eq!(std::fs::read_to_string(file.path())?, "image rbd/img1");
        Ok(())
    }

    #[tokio::test]
    async fn failed_export_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;

        let err = rbd
            .export("rbd", "broken", &CallControl::default())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

        assert_eq!(err.kind(), ErrorKind::Tool);
        assert_eq!(std::fs::read_dir(dir.path().join("scratch"))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn image_exists_maps_exit_codes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;
        let control = CallControl::default();

        assert!(rbd.image_exists("rbd", "present", &control).await?);
        assert!(!rbd.image_exists("rbd", "absent", &control).await?);
        let err = rbd.image_exists("rbd", "locked", &control).await.err();
        assert!(matches!(err, Some(PipelineError::Tool { ref status, .. }) if status == "status 13"));
        Ok(())
    }

    #[tokio::test]
    async fn import_passes_source_then_target() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;
        let source = dir.path().join("restore.rbd");
        std::fs::write(&source, b"raw")?;

        rbd.import("rbd", "img9", &source, &CallControl::default()).await?;

        assert_eq!(std::fs::read(dir.path().join("imported-rbd_img9"))?, b"raw");
        Ok(())
    }

    #[tokio::test]
    async fn version_reports_first_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;
        assert_eq!(rbd.version(&CallControl::default()).await?, "rbd version 18.2.0 (fake)");
        Ok(())
    }

    #[tokio::test]
    async fn list_images_skips_blank_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rbd = client(dir.path())?;
        assert_eq!(rbd.list_images("rbd", &CallControl::default()).await?, vec!["img1", "img2"]);
        Ok(())
    }
}
