//! S3-compatible object store (MinIO, Ceph RGW, AWS) via `aws-sdk-s3`.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::{ByteStream, Length},
    types::{CompletedMultipartUpload, CompletedPart},
};
use base64::{Engine as _, engine::general_purpose};
use tokio::{fs::File, io::AsyncReadExt};
use tracing::{debug, info, warn};

use crate::{
    config::StorageConfig,
    errors::{PipelineError, PipelineResult},
    services::{
        control::CallControl,
        object_store::{
            ObjectStore, StorageError, StorageResult, UploadAttributes, UploadReceipt,
            validate_bucket_name, validate_object_key, TOOL_NAME,
        },
        scratch::ScratchFile,
    },
};

const MIB: u64 = 1024 * 1024;
/// S3 rejects multipart parts smaller than this (except the last).
const MIN_PART_SIZE: u64 = 5 * MIB;
/// S3 and MinIO reject part numbers above this.
const MAX_PARTS: u64 = 10_000;
const DIGEST_BUFFER: usize = 256 * 1024;

pub struct S3Store {
    client: Client,
    endpoint: String,
    bucket: String,
    region: String,
    part_size: u64,
}

impl S3Store {
    /// Build a client from explicit settings. Missing endpoint, credentials
    /// or bucket are configuration errors.
    pub async fn connect(config: &StorageConfig) -> PipelineResult<Self> {
        let endpoint = required(config.endpoint.as_deref(), "storage.endpoint")?;
        let access_key = required(config.access_key.as_deref(), "storage.access_key")?;
        let secret_key = required(config.secret_key.as_deref(), "storage.secret_key")?;
        let bucket = required(config.bucket_name.as_deref(), "storage.bucket_name")?;
        validate_bucket_name(bucket).map_err(|err| PipelineError::config(err.to_string()))?;

        let endpoint_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else if config.use_ssl {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, TOOL_NAME);
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&endpoint_url)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        debug!("configured S3 client for {} (bucket {})", endpoint_url, bucket);
        Ok(Self {
            client: Client::from_conf(s3_config),
            endpoint: endpoint_url,
            bucket: bucket.to_string(),
            region: config.region.clone(),
            part_size: (config.multipart_threshold_mb * MIB).max(MIN_PART_SIZE),
        })
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_error = err.into_service_error();
                if !service_error.is_not_found() {
                    return Err(StorageError::remote(
                        "check bucket",
                        DisplayErrorContext(&service_error).to_string(),
                    ));
                }

                info!("creating bucket {}", self.bucket);
                let mut create = self.client.create_bucket().bucket(&self.bucket);
                if self.region != "us-east-1" {
                    use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
                    let location = BucketLocationConstraint::from(self.region.as_str());
                    create = create.create_bucket_configuration(
                        CreateBucketConfiguration::builder()
                            .location_constraint(location)
                            .build(),
                    );
                }
                create.send().await.map_err(|err| {
                    StorageError::remote("create bucket", DisplayErrorContext(&err).to_string())
                })?;
                Ok(())
            }
        }
    }

    async fn put_whole(
        &self,
        source: &Path,
        object_name: &str,
        attributes: &UploadAttributes,
        size: u64,
    ) -> StorageResult<String> {
        let content_md5 = file_md5(source).await?;
        let body = ByteStream::from_path(source)
            .await
            .map_err(|err| StorageError::io("open upload source", source, std::io::Error::other(err)))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_name)
            .content_type(attributes.content_type)
            .content_length(size as i64)
            .content_md5(general_purpose::STANDARD.encode(content_md5))
            .body(body);
        for (key, value) in &attributes.metadata {
            request = request.metadata(*key, value);
        }

        let output = request.send().await.map_err(|err| {
            StorageError::remote("upload object", DisplayErrorContext(&err).to_string())
        })?;
        Ok(output.e_tag().unwrap_or_default().trim_matches('"').to_string())
    }

    async fn put_multipart(
        &self,
        source: &Path,
        object_name: &str,
        attributes: &UploadAttributes,
        size: u64,
    ) -> StorageResult<String> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name)
            .content_type(attributes.content_type);
        for (key, value) in &attributes.metadata {
            create = create.metadata(*key, value);
        }
        let created = create.send().await.map_err(|err| {
            StorageError::remote("start multipart upload", DisplayErrorContext(&err).to_string())
        })?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::remote("start multipart upload", "no upload id returned"))?
            .to_string();

        match self.upload_parts(source, object_name, &upload_id, size).await {
            Ok(etag) => Ok(etag),
            Err(err) => {
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object_name)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    warn!(
                        "failed to abort multipart upload {}: {}",
                        upload_id,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        source: &Path,
        object_name: &str,
        upload_id: &str,
        size: u64,
    ) -> StorageResult<String> {
        let part_size = part_size_for(self.part_size, size);
        if part_size > self.part_size {
            debug!("raised part size to {} bytes for {}", part_size, object_name);
        }
        let mut parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;
        while offset < size {
            let length = part_size.min(size - offset);
            let body = ByteStream::read_from()
                .path(source)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|err| StorageError::io("read upload part", source, std::io::Error::other(err)))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_name)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|err| {
                    StorageError::remote("upload part", DisplayErrorContext(&err).to_string())
                })?;
            debug!("uploaded part {} of {} ({} bytes)", part_number, object_name, length);

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += length;
            part_number += 1;
        }

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_name)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                StorageError::remote("complete multipart upload", DisplayErrorContext(&err).to_string())
            })?;
        Ok(completed.e_tag().unwrap_or_default().trim_matches('"').to_string())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn describe(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    async fn upload(
        &self,
        source: &Path,
        object_name: &str,
        control: &CallControl,
    ) -> StorageResult<UploadReceipt> {
        validate_object_key(object_name)?;
        info!("uploading {} as {}", source.display(), object_name);

        let receipt = control
            .run("upload object", async {
                self.ensure_bucket().await?;

                let size = tokio::fs::metadata(source)
                    .await
                    .map_err(|err| StorageError::io("stat upload source", source, err))?
                    .len();
                let attributes = UploadAttributes::for_file(source);
                let etag = if size > self.part_size {
                    self.put_multipart(source, object_name, &attributes, size).await?
                } else {
                    self.put_whole(source, object_name, &attributes, size).await?
                };
                Ok::<_, StorageError>(UploadReceipt { etag, size_bytes: size })
            })
            .await?;

        info!(
            "uploaded {} to {} (etag {}, {} bytes)",
            object_name,
            self.describe(),
            receipt.etag,
            receipt.size_bytes
        );
        Ok(receipt)
    }

    async fn download(
        &self,
        object_name: &str,
        destination: &Path,
        control: &CallControl,
    ) -> StorageResult<u64> {
        validate_object_key(object_name)?;
        info!("downloading {} to {}", object_name, destination.display());

        control
            .run("download object", async {
                let response = match self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(object_name)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        let service_error = err.into_service_error();
                        if service_error.is_no_such_key() {
                            return Err(StorageError::ObjectNotFound {
                                bucket: self.bucket.clone(),
                                key: object_name.to_string(),
                            });
                        }
                        return Err(StorageError::remote(
                            "download object",
                            DisplayErrorContext(&service_error).to_string(),
                        ));
                    }
                };
                let recorded = response.content_length().unwrap_or_default().max(0) as u64;

                let mut file = File::create(destination)
                    .await
                    .map_err(|err| StorageError::io("create download target", destination, err))?;
                let target = ScratchFile::new(destination);
                let mut body = response.body.into_async_read();
                let copied = tokio::io::copy(&mut body, &mut file)
                    .await
                    .map_err(|err| StorageError::io("write download target", destination, err))?;
                tokio::io::AsyncWriteExt::flush(&mut file)
                    .await
                    .map_err(|err| StorageError::io("flush download target", destination, err))?;
                target.persist();

                if recorded != 0 && copied != recorded {
                    warn!(
                        "downloaded {} bytes of {} but store recorded {}",
                        copied, object_name, recorded
                    );
                }
                Ok(copied)
            })
            .await
    }

    async fn list(&self, prefix: Option<&str>, control: &CallControl) -> StorageResult<Vec<String>> {
        control
            .run("list objects", async {
                let mut keys = Vec::new();
                let mut pages = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .set_prefix(prefix.map(str::to_string))
                    .into_paginator()
                    .send();
                while let Some(page) = pages.next().await {
                    let page = page.map_err(|err| {
                        StorageError::remote("list objects", DisplayErrorContext(&err).to_string())
                    })?;
                    keys.extend(page.contents().iter().filter_map(|object| object.key().map(str::to_string)));
                }
                debug!("found {} objects with prefix {:?}", keys.len(), prefix);
                Ok::<_, StorageError>(keys)
            })
            .await
    }

    async fn delete(&self, object_name: &str, control: &CallControl) -> StorageResult<()> {
        validate_object_key(object_name)?;
        control
            .run("delete object", async {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(object_name)
                    .send()
                    .await
                    .map_err(|err| {
                        StorageError::remote("delete object", DisplayErrorContext(&err).to_string())
                    })?;
                info!("deleted {} from {}", object_name, self.describe());
                Ok::<_, StorageError>(())
            })
            .await
    }

    async fn exists(&self, object_name: &str, control: &CallControl) -> StorageResult<bool> {
        validate_object_key(object_name)?;
        control
            .run("stat object", async {
                match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(object_name)
                    .send()
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(err) => {
                        let service_error = err.into_service_error();
                        if service_error.is_not_found() {
                            Ok(false)
                        } else {
                            Err(StorageError::remote(
                                "stat object",
                                DisplayErrorContext(&service_error).to_string(),
                            ))
                        }
                    }
                }
            })
            .await
    }
}

/// Smallest whole-MiB part size, at least `base`, that fits `size` into
/// [`MAX_PARTS`] parts.
fn part_size_for(base: u64, size: u64) -> u64 {
    base.max(size.div_ceil(MAX_PARTS).div_ceil(MIB) * MIB)
}

fn required<'a>(value: Option<&'a str>, key: &str) -> PipelineResult<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PipelineError::config(format!("{key} is not configured")))
}

/// Raw MD5 of a file, sent as `Content-MD5` so the store verifies the body.
async fn file_md5(path: &Path) -> StorageResult<[u8; 16]> {
    let mut file = File::open(path)
        .await
        .map_err(|err| StorageError::io("open upload source", path, err))?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; DIGEST_BUFFER];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|err| StorageError::io("hash upload source", path, err))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(context.compute().0)
}
