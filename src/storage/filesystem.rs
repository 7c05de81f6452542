//! Local filesystem storage backend. Multipart upload is optional for
//! filesystem providers (spec §4.3); this implementation buffers parts in
//! a per-upload temp directory and concatenates them on completion so the
//! same [`StorageBackend`] trait drives both cloud and local repositories.

use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{PartHandle, StorageBackend};
use crate::error::{StorageError, StorageResult};

pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, container: &str, id: &str) -> PathBuf {
        self.root.join(container).join(id)
    }

    fn upload_staging_dir(&self, container: &str, upload_id: &str) -> PathBuf {
        self.root.join(container).join(".multipart").join(upload_id)
    }

    fn map_io_err(e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::ObjectNotFound(e.to_string())
        } else {
            StorageError::Provider(e.to_string())
        }
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put_object(
        &self,
        container: &str,
        id: &str,
        data: Bytes,
        expected_size: u64,
    ) -> StorageResult<()> {
        if data.len() as u64 != expected_size {
            return Err(StorageError::ChecksumMismatch(format!(
                "{container}/{id}: size {} != expected {}",
                data.len(),
                expected_size
            )));
        }
        let final_path = self.object_path(container, id);
        let tmp_path = final_path.with_extension("tmp");
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(Self::map_io_err)?;
        }
        {
            let mut f = fs::File::create(&tmp_path).map_err(Self::map_io_err)?;
            f.write_all(&data).map_err(Self::map_io_err)?;
            f.sync_all().map_err(Self::map_io_err)?;
        }
        fs::rename(&tmp_path, &final_path).map_err(Self::map_io_err)?;
        Ok(())
    }

    async fn get_object(&self, container: &str, id: &str) -> StorageResult<Bytes> {
        let path = self.object_path(container, id);
        let data = fs::read(&path).map_err(Self::map_io_err)?;
        Ok(Bytes::from(data))
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.root.join(container);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&base) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if rel_str.starts_with(prefix) && !rel_str.starts_with(".multipart") {
                    out.push(rel_str);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn delete_object(&self, container: &str, id: &str) -> StorageResult<()> {
        let path = self.object_path(container, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound(id.to_string()))
            }
            Err(e) => Err(StorageError::Provider(e.to_string())),
        }
    }

    async fn object_exists(&self, container: &str, id: &str) -> StorageResult<bool> {
        Ok(self.object_path(container, id).exists())
    }

    async fn create_container(
        &self,
        _container: &str,
        base_name: &str,
        auto_find_suffix: bool,
    ) -> StorageResult<String> {
        let mut name = base_name.to_string();
        let mut suffix = 1u32;
        loop {
            let path = self.root.join(&name);
            if !path.exists() {
                fs::create_dir_all(&path).map_err(Self::map_io_err)?;
                return Ok(name);
            }
            if !auto_find_suffix {
                return Err(StorageError::ContainerExists(name));
            }
            name = format!("{base_name}-{suffix}");
            suffix += 1;
        }
    }

    async fn initiate_multipart(&self, container: &str, _id: &str) -> StorageResult<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let staging = self.upload_staging_dir(container, &upload_id);
        fs::create_dir_all(&staging).map_err(Self::map_io_err)?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        container: &str,
        _id: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<PartHandle> {
        let staging = self.upload_staging_dir(container, upload_id);
        let part_path = staging.join(format!("{part_number:08}.part"));
        fs::write(&part_path, &data).map_err(Self::map_io_err)?;
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
        let staging = self.upload_staging_dir(container, upload_id);
        let final_path = self.object_path(container, id);
        let tmp_path = final_path.with_extension("tmp");
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(Self::map_io_err)?;
        }
        {
            let mut out = fs::File::create(&tmp_path).map_err(Self::map_io_err)?;
            for part in &parts {
                let part_path = staging.join(format!("{:08}.part", part.part_number));
                let bytes = fs::read(&part_path).map_err(Self::map_io_err)?;
                out.write_all(&bytes).map_err(Self::map_io_err)?;
            }
            out.sync_all().map_err(Self::map_io_err)?;
        }
        fs::rename(&tmp_path, &final_path).map_err(Self::map_io_err)?;
        let _ = fs::remove_dir_all(&staging);
        Ok(())
    }

    async fn abort_multipart(
        &self,
        container: &str,
        _id: &str,
        upload_id: &str,
    ) -> StorageResult<()> {
        let staging = self.upload_staging_dir(container, upload_id);
        let _ = fs::remove_dir_all(&staging);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let data = Bytes::from_static(b"hello");
        backend
            .put_object("repo", "ab/abcdef", data.clone(), 5)
            .await
            .unwrap();
        let read_back = backend.get_object("repo", "ab/abcdef").await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let err = backend.get_object("repo", "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn multipart_upload_reassembles_parts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let upload_id = backend.initiate_multipart("repo", "big").await.unwrap();
        let p2 = backend
            .upload_part("repo", "big", &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = backend
            .upload_part("repo", "big", &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        backend
            .complete_multipart("repo", "big", &upload_id, vec![p2, p1])
            .await
            .unwrap();
        let data = backend.get_object("repo", "big").await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn no_partial_object_visible_after_abort() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let upload_id = backend.initiate_multipart("repo", "big").await.unwrap();
        backend
            .upload_part("repo", "big", &upload_id, 1, Bytes::from_static(b"partial"))
            .await
            .unwrap();
        backend
            .abort_multipart("repo", "big", &upload_id)
            .await
            .unwrap();
        assert!(!backend.object_exists("repo", "big").await.unwrap());
    }
}
