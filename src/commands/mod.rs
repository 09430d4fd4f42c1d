//! Command handlers. Each takes the owned config, builds the components it
//! needs and reports to stdout; logs go to stderr.

pub mod health_commands;
pub mod object_commands;
pub mod pipeline_commands;

use std::{error::Error, sync::Arc};

use crate::{
    config::{StorageBackend, StorageConfig},
    errors::{PipelineError, PipelineResult},
    services::{local_store::LocalStore, object_store::ObjectStore, s3_store::S3Store},
};

/// Build the configured object store gateway.
pub async fn open_store(storage: StorageConfig) -> PipelineResult<Arc<dyn ObjectStore>> {
    match storage.backend {
        StorageBackend::S3 => Ok(Arc::new(S3Store::connect(&storage).await?)),
        StorageBackend::Local => {
            let root = storage
                .root
                .ok_or_else(|| PipelineError::config("storage.root is not configured"))?;
            let bucket = storage
                .bucket_name
                .ok_or_else(|| PipelineError::config("storage.bucket_name is not configured"))?;
            Ok(Arc::new(LocalStore::open(root, bucket).await?))
        }
    }
}

/// `err` and its sources joined with `: `.
pub fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
