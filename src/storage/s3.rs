//! AWS S3 storage backend — the "native" interface kind (spec §4.3:
//! concrete provider SDK used directly rather than through the generic
//! capability surface).

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Region,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;

use super::{PartHandle, StorageBackend, StorageConfig};
use crate::error::{StorageError, StorageResult};

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let (region, bucket, endpoint) = match config {
            StorageConfig::S3 {
                region,
                bucket,
                endpoint,
            } => (region.clone(), bucket.clone(), endpoint.clone()),
            _ => {
                return Err(StorageError::Provider(
                    "S3Backend requires a StorageConfig::S3".to_string(),
                ))
            }
        };

        let mut config_builder = aws_config::from_env().region(Region::new(region));
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let aws_config = config_builder.load().await;
        let client = Client::new(&aws_config);

        Ok(Self { client, bucket })
    }

    fn map_s3_error<E: std::fmt::Display>(err: E) -> StorageError {
        let msg = err.to_string();
        if msg.contains("NoSuchKey") || msg.contains("NotFound") {
            StorageError::ObjectNotFound(msg)
        } else if msg.contains("Throttl") || msg.contains("SlowDown") {
            StorageError::Throttled(msg)
        } else if msg.contains("Forbidden") || msg.contains("AccessDenied") || msg.contains("credentials")
        {
            StorageError::AuthFailed(msg)
        } else {
            StorageError::Network(msg)
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn put_object(
        &self,
        container: &str,
        id: &str,
        data: Bytes,
        expected_size: u64,
    ) -> StorageResult<()> {
        if data.len() as u64 != expected_size {
            return Err(StorageError::ChecksumMismatch(format!(
                "{id}: size {} != expected {}",
                data.len(),
                expected_size
            )));
        }
        let key = format!("{container}/{id}");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok(())
    }

    async fn get_object(&self, container: &str, id: &str) -> StorageResult<Bytes> {
        let key = format!("{container}/{id}");
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        let data = output
            .body
            .collect()
            .await
            .map_err(Self::map_s3_error)?
            .into_bytes();
        Ok(data)
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = format!("{container}/{prefix}");
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .send()
            .await
            .map_err(Self::map_s3_error)?;

        let container_prefix = format!("{container}/");
        Ok(output
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|k| k.strip_prefix(&container_prefix).unwrap_or(k).to_string())
            .collect())
    }

    async fn delete_object(&self, container: &str, id: &str) -> StorageResult<()> {
        let key = format!("{container}/{id}");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok(())
    }

    async fn object_exists(&self, container: &str, id: &str) -> StorageResult<bool> {
        let key = format!("{container}/{id}");
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::map_s3_error(e) {
                StorageError::ObjectNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_container(
        &self,
        _container: &str,
        base_name: &str,
        _auto_find_suffix: bool,
    ) -> StorageResult<String> {
        // S3 containers map to key prefixes within one bucket; no
        // provider-side creation step is needed.
        Ok(base_name.to_string())
    }

    async fn initiate_multipart(&self, container: &str, id: &str) -> StorageResult<String> {
        let key = format!("{container}/{id}");
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        output
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Provider("no upload id returned".to_string()))
    }

    async fn upload_part(
        &self,
        container: &str,
        id: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartHandle> {
        let key = format!("{container}/{id}");
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        let etag = output
            .e_tag()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::Provider("no etag returned".to_string()))?;
        Ok(PartHandle { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        container: &str,
        id: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> StorageResult<()> {
        let key = format!("{container}/{id}");
        let completed_parts: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        container: &str,
        id: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        let key = format!("{container}/{id}");
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(Self::map_s3_error)?;
        Ok(())
    }
}
