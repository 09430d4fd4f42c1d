//! Error taxonomy shared by the transform stages and both orchestrators.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::services::{control::Interrupted, object_store::StorageError};

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Coarse classification used when deciding whether a failure is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required setting is missing or malformed; fatal to the whole run.
    Config,
    /// The cluster control plane could not be queried or returned bad data.
    Cluster,
    /// An invoked tool exited non-zero.
    Tool,
    /// Local file I/O failed.
    Resource,
    /// The object store rejected or failed a request.
    Storage,
    /// Cancelled by the caller or past its deadline.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cluster query `{operation}` failed: {message}")]
    Cluster {
        operation: &'static str,
        message: String,
    },

    #[error("volume `{volume}` is missing required attribute `{attribute}`")]
    MissingAttribute {
        volume: String,
        attribute: String,
    },

    #[error("`{tool}` exited with {status}: {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{operation} failed for {}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image `{pool}/{image}` already exists; pass --force to import over it")]
    ImageExists { pool: String, image: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl PipelineError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::ImageExists { .. } => ErrorKind::Config,
            Self::Cluster { .. } | Self::MissingAttribute { .. } => ErrorKind::Cluster,
            Self::Tool { .. } => ErrorKind::Tool,
            Self::Io { .. } => ErrorKind::Resource,
            Self::Storage(StorageError::Interrupted(_)) | Self::Interrupted(_) => {
                ErrorKind::Interrupted
            }
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}
