use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::services::{gpg::KeyMaterial, object_store::validate_bucket_name, scratch::DEFAULT_SCRATCH_DIR};

/// File looked up in `$HOME` when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = ".ceph-pvc-backup.yaml";

pub const ENV_ACCESS_KEY: &str = "MINIO_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "MINIO_SECRET_KEY";
pub const ENV_BUCKET: &str = "CEPH_PVC_BACKUP_BUCKET";
pub const ENV_ENDPOINT: &str = "CEPH_PVC_BACKUP_ENDPOINT";

/// Command-line configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Back up Ceph RBD volumes behind Kubernetes PVCs to object storage"
)]
pub struct Cli {
    /// YAML config file (default: $HOME/.ceph-pvc-backup.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubernetes namespace to back up
    #[arg(short, long, global = true, default_value = "default")]
    pub namespace: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// kubeconfig used by kubectl (overrides kubernetes.kubeconfig)
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Object store backend (overrides storage.backend)
    #[arg(long, global = true, value_enum)]
    pub backend: Option<StorageBackend>,

    /// Object store bucket (overrides storage.bucket_name and CEPH_PVC_BACKUP_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Object store endpoint (overrides storage.endpoint and CEPH_PVC_BACKUP_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// GPG recipient for encryption (overrides gpg.recipient)
    #[arg(long, global = true)]
    pub recipient: Option<String>,

    /// Scratch directory for intermediate files (overrides backup.temp_dir)
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Per-call timeout in seconds for external tools and the object store
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Back up every Ceph-backed claim in the namespace (default)
    Backup,
    /// Restore one backup object into a block image
    Restore {
        /// Object name, e.g. data-rbd-img1.rbd.gz.gpg
        object: String,
        /// Target pool
        pool: String,
        /// Target image
        image: String,
        /// Import even when the target image already exists
        #[arg(long)]
        force: bool,
    },
    /// List backup objects
    List {
        /// Only list objects whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check cluster, rbd, gpg and object store access
    Validate {
        /// Also list images in this pool
        #[arg(long)]
        pool: Option<String>,
    },
    /// Delete one backup object
    Delete {
        /// Object name to delete
        object: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub kubectl_path: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Substring a volume's CSI driver name must contain to be backed up.
    pub driver_token: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl_path: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
            driver_token: "ceph".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CephConfig {
    pub rbd_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub keyring_path: Option<PathBuf>,
}

impl Default for CephConfig {
    fn default() -> Self {
        Self {
            rbd_path: PathBuf::from("rbd"),
            config_path: None,
            keyring_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    pub path: PathBuf,
    pub recipient: Option<String>,
    pub homedir: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub trust_model: String,
    pub passphrase_file: Option<PathBuf>,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gpg"),
            recipient: None,
            homedir: None,
            keyring: None,
            trust_model: "always".into(),
            passphrase_file: None,
        }
    }
}

impl GpgConfig {
    /// Private key capability handed to restore.
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial {
            homedir: self.homedir.clone(),
            keyring: self.keyring.clone(),
            passphrase_file: self.passphrase_file.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_ssl: bool,
    pub region: String,
    pub bucket_name: Option<String>,
    /// Root directory of the local backend.
    pub root: Option<PathBuf>,
    pub multipart_threshold_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            endpoint: None,
            access_key: None,
            secret_key: None,
            use_ssl: false,
            region: "us-east-1".into(),
            bucket_name: None,
            root: None,
            multipart_threshold_mb: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub temp_dir: PathBuf,
    pub operation_timeout_secs: Option<u64>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            operation_timeout_secs: None,
        }
    }
}

impl BackupConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Layout of the YAML config file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub kubernetes: KubernetesConfig,
    pub ceph: CephConfig,
    pub gpg: GpgConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
}

impl FileConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing YAML config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Centralized application configuration.
/// Built once at startup, then split and moved into each component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub namespace: String,
    pub kubernetes: KubernetesConfig,
    pub ceph: CephConfig,
    pub gpg: GpgConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
}

impl AppConfig {
    /// Merge file, process environment and CLI args into a validated config.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Self::resolve(cli, |key| env::var(key).ok())
    }

    /// Same as [`from_cli`](Self::from_cli) with an explicit environment lookup.
    pub fn resolve(cli: &Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- File ---
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => match lookup("HOME").map(|home| Path::new(&home).join(DEFAULT_CONFIG_FILE)) {
                Some(path) if path.is_file() => FileConfig::load(&path)?,
                _ => FileConfig::default(),
            },
        };
        let FileConfig {
            mut kubernetes,
            ceph,
            mut gpg,
            mut storage,
            mut backup,
        } = file;

        // --- Environment ---
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = non_empty(ENV_ACCESS_KEY) {
            storage.access_key = Some(value);
        }
        if let Some(value) = non_empty(ENV_SECRET_KEY) {
            storage.secret_key = Some(value);
        }
        if let Some(value) = non_empty(ENV_BUCKET) {
            storage.bucket_name = Some(value);
        }
        if let Some(value) = non_empty(ENV_ENDPOINT) {
            storage.endpoint = Some(value);
        }

        // --- CLI ---
        if let Some(kubeconfig) = &cli.kubeconfig {
            kubernetes.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(backend) = cli.backend {
            storage.backend = backend;
        }
        if let Some(bucket) = &cli.bucket {
            storage.bucket_name = Some(bucket.clone());
        }
        if let Some(endpoint) = &cli.endpoint {
            storage.endpoint = Some(endpoint.clone());
        }
        if let Some(recipient) = &cli.recipient {
            gpg.recipient = Some(recipient.clone());
        }
        if let Some(temp_dir) = &cli.temp_dir {
            backup.temp_dir = temp_dir.clone();
        }
        if let Some(timeout) = cli.timeout {
            backup.operation_timeout_secs = Some(timeout);
        }

        let cfg = Self {
            namespace: cli.namespace.clone(),
            kubernetes,
            ceph,
            gpg,
            storage,
            backup,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that hold for every command. Encryption settings are checked
    /// when the encrypting client is built, since only backup needs them.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            bail!("namespace must not be empty");
        }
        if self.kubernetes.driver_token.trim().is_empty() {
            bail!("kubernetes.driver_token must not be empty");
        }

        let storage = &self.storage;
        let bucket = storage
            .bucket_name
            .as_deref()
            .filter(|name| !name.trim().is_empty());
        let Some(bucket) = bucket else {
            bail!("storage.bucket_name is not configured (set it, {ENV_BUCKET} or --bucket)");
        };
        validate_bucket_name(bucket)?;

        match storage.backend {
            StorageBackend::S3 => {
                let missing: Vec<&str> = [
                    ("storage.endpoint", &storage.endpoint),
                    ("storage.access_key", &storage.access_key),
                    ("storage.secret_key", &storage.secret_key),
                ]
                .into_iter()
                .filter(|(_, value)| value.as_deref().is_none_or(|v| v.trim().is_empty()))
                .map(|(key, _)| key)
                .collect();
                if !missing.is_empty() {
                    bail!("missing object store settings: {}", missing.join(", "));
                }
            }
            StorageBackend::Local => {
                if storage.root.is_none() {
                    bail!("storage.root is required for the local backend");
                }
            }
        }
        if storage.multipart_threshold_mb == 0 {
            bail!("storage.multipart_threshold_mb must be positive");
        }
        Ok(())
    }
}
