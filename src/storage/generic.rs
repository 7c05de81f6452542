//! Generic cloud storage backend — the "generic" interface kind (spec §4.3
//! / §3's `interface kind {native, generic}`): backed by Google Cloud
//! Storage here, but restricted to the capability set in [`StorageBackend`]
//! rather than GCS-specific extras, so a future provider can be swapped in
//! behind the same trait.
//!
//! GCS has no native multipart concept (it uses resumable uploads); parts
//! are buffered here keyed by upload id and concatenated into a single
//! object on `complete_multipart`, mirroring how the filesystem backend
//! simulates multipart for providers without one.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::{
    delete::DeleteObjectRequest,
    download::Range,
    get::GetObjectRequest,
    list::ListObjectsRequest,
    upload::{Media, UploadObjectRequest, UploadType},
};

use super::{PartHandle, StorageBackend, StorageConfig};
use crate::error::{StorageError, StorageResult};

pub struct GenericBackend {
    client: Client,
    bucket: String,
    pending_parts: DashMap<String, Vec<(u32, Bytes)>>,
}

impl GenericBackend {
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let bucket = match config {
            StorageConfig::Generic { bucket, .. } => bucket.clone(),
            _ => {
                return Err(StorageError::Provider(
                    "GenericBackend requires a StorageConfig::Generic".to_string(),
                ))
            }
        };
        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(Self::map_gcs_error)?;
        let client = Client::new(client_config);
        Ok(Self {
            client,
            bucket,
            pending_parts: DashMap::new(),
        })
    }

    fn map_gcs_error<E: std::fmt::Display>(err: E) -> StorageError {
        StorageError::Network(err.to_string())
    }

    async fn put_bytes(&self, object: &str, data: Bytes) -> StorageResult<()> {
        let upload_type = UploadType::Simple(Media::new(object.to_string()));
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data.to_vec(),
                &upload_type,
            )
            .await
            .map_err(Self::map_gcs_error)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for GenericBackend {
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
        let object = format!("{container}/{id}");
        self.put_bytes(&object, data).await
    }

    async fn get_object(&self, container: &str, id: &str) -> StorageResult<Bytes> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: format!("{container}/{id}"),
            ..Default::default()
        };
        let data = self
            .client
            .download_object(&request, &Range::default())
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("404") || msg.contains("NotFound") {
                    StorageError::ObjectNotFound(msg)
                } else {
                    Self::map_gcs_error(msg)
                }
            })?;
        Ok(Bytes::from(data))
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix: Some(format!("{container}/{prefix}")),
            ..Default::default()
        };
        let response = self
            .client
            .list_objects(&request)
            .await
            .map_err(Self::map_gcs_error)?;
        let container_prefix = format!("{container}/");
        Ok(response
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|obj| {
                obj.name
                    .strip_prefix(&container_prefix)
                    .unwrap_or(&obj.name)
                    .to_string()
            })
            .collect())
    }

    async fn delete_object(&self, container: &str, id: &str) -> StorageResult<()> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: format!("{container}/{id}"),
            ..Default::default()
        };
        self.client
            .delete_object(&request)
            .await
            .map_err(Self::map_gcs_error)?;
        Ok(())
    }

    async fn object_exists(&self, container: &str, id: &str) -> StorageResult<bool> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: format!("{container}/{id}"),
            ..Default::default()
        };
        match self.client.get_object(&request).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn create_container(
        &self,
        _container: &str,
        base_name: &str,
        _auto_find_suffix: bool,
    ) -> StorageResult<String> {
        Ok(base_name.to_string())
    }

    async fn initiate_multipart(&self, _container: &str, _id: &str) -> StorageResult<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.pending_parts.insert(upload_id.clone(), Vec::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _container: &str,
        _id: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartHandle> {
        let mut entry = self
            .pending_parts
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::Provider(format!("unknown upload id {upload_id}")))?;
        entry.push((part_number, data.clone()));
        Ok(PartHandle {
            part_number,
            etag: format!("{part_number}-{}", data.len()),
        })
    }

    async fn complete_multipart(
        &self,
        container: &str,
        id: &str,
        upload_id: &str,
        mut parts: Vec<PartHandle>,
    ) -> StorageResult<()> {
        parts.sort_by_key(|p| p.part_number);
        let (_, mut buffered) = self
            .pending_parts
            .remove(upload_id)
            .ok_or_else(|| StorageError::Provider(format!("unknown upload id {upload_id}")))?;
        buffered.sort_by_key(|(n, _)| *n);
        let mut whole = Vec::new();
        for (_, chunk) in buffered {
            whole.extend_from_slice(&chunk);
        }
        let object = format!("{container}/{id}");
        self.put_bytes(&object, Bytes::from(whole)).await
    }

    async fn abort_multipart(
        &self,
        _container: &str,
        _id: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        self.pending_parts.remove(upload_id);
        Ok(())
    }
}
