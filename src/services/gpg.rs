//! GnuPG stage: armored public-key encryption and its inverse.
//!
//! Encryption only needs the recipient's public key. Decryption needs private
//! key material, which the caller hands over explicitly as a [`KeyMaterial`].

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    config::GpgConfig,
    errors::{PipelineError, PipelineResult},
    models::artifact::ENCRYPTED_SUFFIX,
    services::{
        compression::{append_suffix, strip_suffix},
        control::CallControl,
        process::ToolCommand,
        scratch::ScratchFile,
    },
};

/// Where the private key lives and how to unlock it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMaterial {
    pub homedir: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub passphrase_file: Option<PathBuf>,
}

fn base_command(gpg: &Path, label: &str, homedir: Option<&PathBuf>, keyring: Option<&PathBuf>) -> ToolCommand {
    ToolCommand::new(gpg, label)
        .arg("--batch")
        .arg("--yes")
        .opt_flag("--homedir", homedir)
        .opt_flag("--keyring", keyring)
}

async fn stat_output(file: &ScratchFile, operation: &'static str) -> PipelineResult<u64> {
    Ok(tokio::fs::metadata(file.path())
        .await
        .map_err(|err| PipelineError::io(operation, file.path(), err))?
        .len())
}

pub struct GpgEncryptor {
    gpg: PathBuf,
    recipient: String,
    trust_model: String,
    homedir: Option<PathBuf>,
    keyring: Option<PathBuf>,
}

impl GpgEncryptor {
    /// Fails when no recipient is configured.
    pub fn new(config: GpgConfig) -> PipelineResult<Self> {
        let recipient = config
            .recipient
            .filter(|recipient| !recipient.trim().is_empty())
            .ok_or_else(|| PipelineError::config("gpg.recipient is not configured"))?;
        let trust_model = if config.trust_model.trim().is_empty() {
            "always".to_string()
        } else {
            config.trust_model
        };
        Ok(Self {
            gpg: config.path,
            recipient,
            trust_model,
            homedir: config.homedir,
            keyring: config.keyring,
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    fn command(&self, label: &str) -> ToolCommand {
        base_command(&self.gpg, label, self.homedir.as_ref(), self.keyring.as_ref())
    }

    /// Encrypt `input` to `input.gpg` (ASCII armored).
    pub async fn encrypt(&self, input: &Path, control: &CallControl) -> PipelineResult<(ScratchFile, u64)> {
        let target = ScratchFile::new(append_suffix(input, ENCRYPTED_SUFFIX));
        debug!("encrypting {} for {}", input.display(), self.recipient);

        self.command("gpg encrypt")
            .arg("--trust-model")
            .arg(&self.trust_model)
            .arg("--encrypt")
            .arg("--armor")
            .arg("--recipient")
            .arg(&self.recipient)
            .arg("--output")
            .arg(target.path())
            .arg(input)
            .run(control, "gpg encrypt")
            .await?;

        let size = stat_output(&target, "stat encrypted file").await?;
        info!("encrypted {} ({} bytes)", target.path().display(), size);
        Ok((target, size))
    }

    /// Check that the recipient's public key is in the keyring.
    pub async fn validate_recipient(&self, control: &CallControl) -> PipelineResult<()> {
        self.command("gpg --list-keys")
            .arg("--list-keys")
            .arg(&self.recipient)
            .run(control, "gpg list keys")
            .await?;
        debug!("gpg recipient {} is known", self.recipient);
        Ok(())
    }
}

pub struct GpgDecryptor {
    gpg: PathBuf,
}

impl GpgDecryptor {
    pub fn new(gpg: impl Into<PathBuf>) -> Self {
        Self { gpg: gpg.into() }
    }

    /// Decrypt `input` (which must end in `.gpg`) next to itself, without the suffix.
    pub async fn decrypt(
        &self,
        input: &Path,
        keys: &KeyMaterial,
        control: &CallControl,
    ) -> PipelineResult<(ScratchFile, u64)> {
        let target = ScratchFile::new(strip_suffix(input, ENCRYPTED_SUFFIX)?);
        debug!("decrypting {}", input.display());

        let mut command = base_command(&self.gpg, "gpg decrypt", keys.homedir.as_ref(), keys.keyring.as_ref());
        if let Some(passphrase_file) = &keys.passphrase_file {
            command = command
                .arg("--pinentry-mode")
                .arg("loopback")
                .arg("--passphrase-file")
                .arg(passphrase_file);
        }
        command
            .arg("--decrypt")
            .arg("--output")
            .arg(target.path())
            .arg(input)
            .run(control, "gpg decrypt")
            .await?;

        let size = stat_output(&target, "stat decrypted file").await?;
        info!("decrypted {} ({} bytes)", target.path().display(), size);
        Ok((target, size))
    }
}
