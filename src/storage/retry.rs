//! Retry policy and multipart upload driver shared by every
//! [`StorageBackend`](super::StorageBackend) implementation.

use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{PartHandle, StorageBackend};
use crate::error::{StorageError, StorageResult};

/// Exponential backoff with jitter, unbounded by default (spec §4.3/§5:
/// "infinite retries until an external cancel signal" for transient
/// categories). `max_retries` lets a caller opt into a bound — Open
/// Question in spec §9, resolved as an explicit opt-in rather than a
/// changed default.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.min(20));
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=capped.max(1) / 4 + 1);
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Runs `op` until it succeeds, a permanent error occurs, the cancel token
/// fires, or `policy.max_retries` is exhausted.
pub async fn retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StorageResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Provider("cancelled".to_string()));
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if let Some(max) = policy.max_retries {
                    if attempt >= max {
                        return Err(err);
                    }
                }
                let delay = policy.backoff_for(attempt);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(StorageError::Provider("cancelled".to_string()));
                    }
                }
            }
            Err(permanent) => return Err(permanent),
        }
    }
}

/// Default part size used when splitting a put into multipart chunks:
/// 8 MiB, within the 4-16 MiB range spec §4.3 recommends.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Drives a full multipart upload (initiate → per-part retrying uploads →
/// complete), aborting the session on cancellation or permanent failure so
/// no partial object state lingers on the provider.
pub async fn multipart_put(
    backend: &dyn StorageBackend,
    container: &str,
    id: &str,
    data: Bytes,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> StorageResult<()> {
    let upload_id = backend.initiate_multipart(container, id).await?;

    let mut parts = Vec::new();
    let mut offset = 0usize;
    let mut part_number = 1u32;

    let result: StorageResult<()> = async {
        while offset < data.len() {
            let end = (offset + DEFAULT_PART_SIZE).min(data.len());
            let chunk = data.slice(offset..end);
            let part = retry(policy, cancel, || {
                let chunk = chunk.clone();
                async { backend.upload_part(container, id, &upload_id, part_number, chunk).await }
            })
            .await?;
            parts.push(part);
            offset = end;
            part_number += 1;
        }
        Ok(())
    }
    .await;

    if result.is_err() || cancel.is_cancelled() {
        let _ = backend.abort_multipart(container, id, &upload_id).await;
        return result;
    }

    backend
        .complete_multipart(container, id, &upload_id, parts)
        .await
}

/// Helper test double used to exercise [`retry`] and [`multipart_put`]
/// without a real network.
#[cfg(test)]
pub(crate) mod test_backend {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FlakyBackend {
        pub fail_first_n_part_uploads: AtomicU32,
        pub stored: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl StorageBackend for FlakyBackend {
        async fn put_object(&self, _c: &str, _id: &str, _d: Bytes, _s: u64) -> StorageResult<()> {
            Ok(())
        }
        async fn get_object(&self, _c: &str, _id: &str) -> StorageResult<Bytes> {
            Ok(Bytes::new())
        }
        async fn list_objects(&self, _c: &str, _p: &str) -> StorageResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn delete_object(&self, _c: &str, _id: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn object_exists(&self, _c: &str, _id: &str) -> StorageResult<bool> {
            Ok(false)
        }
        async fn create_container(&self, _c: &str, base: &str, _a: bool) -> StorageResult<String> {
            Ok(base.to_string())
        }
        async fn initiate_multipart(&self, _c: &str, _id: &str) -> StorageResult<String> {
            Ok("upload-1".to_string())
        }
        async fn upload_part(
            &self,
            _c: &str,
            _id: &str,
            _upload_id: &str,
            part_number: u32,
            data: Bytes,
        ) -> StorageResult<PartHandle> {
            if self.fail_first_n_part_uploads.load(Ordering::SeqCst) > 0 {
                self.fail_first_n_part_uploads.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Network("simulated".to_string()));
            }
            self.stored.lock().unwrap().push(data);
            Ok(PartHandle {
                part_number,
                etag: format!("etag-{part_number}"),
            })
        }
        async fn complete_multipart(
            &self,
            _c: &str,
            _id: &str,
            _upload_id: &str,
            _parts: Vec<PartHandle>,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn abort_multipart(&self, _c: &str, _id: &str, _upload_id: &str) -> StorageResult<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::FlakyBackend;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn multipart_put_retries_transient_failures() {
        let backend = FlakyBackend {
            fail_first_n_part_uploads: 2.into(),
            ..Default::default()
        };
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: None,
        };
        let cancel = CancellationToken::new();
        let data = Bytes::from(vec![1u8; DEFAULT_PART_SIZE + 10]);

        multipart_put(&backend, "c", "id", data, &policy, &cancel)
            .await
            .unwrap();

        assert_eq!(backend.fail_first_n_part_uploads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.stored.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop() {
        let backend = FlakyBackend {
            fail_first_n_part_uploads: 1000.into(),
            ..Default::default()
        };
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_retries: None,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let data = Bytes::from(vec![1u8; 5]);

        let result = multipart_put(&backend, "c", "id", data, &policy, &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn permanent_error_aborts_without_retry() {
        struct PermanentFailBackend;
        #[async_trait::async_trait]
        impl StorageBackend for PermanentFailBackend {
            async fn put_object(&self, _c: &str, _id: &str, _d: Bytes, _s: u64) -> StorageResult<()> {
                Ok(())
            }
            async fn get_object(&self, _c: &str, _id: &str) -> StorageResult<Bytes> {
                Ok(Bytes::new())
            }
            async fn list_objects(&self, _c: &str, _p: &str) -> StorageResult<Vec<String>> {
                Ok(Vec::new())
            }
            async fn delete_object(&self, _c: &str, _id: &str) -> StorageResult<()> {
                Ok(())
            }
            async fn object_exists(&self, _c: &str, _id: &str) -> StorageResult<bool> {
                Ok(false)
            }
            async fn create_container(&self, _c: &str, base: &str, _a: bool) -> StorageResult<String> {
                Ok(base.to_string())
            }
            async fn initiate_multipart(&self, _c: &str, _id: &str) -> StorageResult<String> {
                Ok("u".to_string())
            }
            async fn upload_part(
                &self,
                _c: &str,
                _id: &str,
                _u: &str,
                _p: u32,
                _d: Bytes,
            ) -> StorageResult<PartHandle> {
                Err(StorageError::AuthFailed("denied".to_string()))
            }
            async fn complete_multipart(
                &self,
                _c: &str,
                _id: &str,
                _u: &str,
                _p: Vec<PartHandle>,
            ) -> StorageResult<()> {
                Ok(())
            }
            async fn abort_multipart(&self, _c: &str, _id: &str, _u: &str) -> StorageResult<()> {
                Ok(())
            }
        }

        let backend = PermanentFailBackend;
        let cancel = CancellationToken::new();
        let data = Bytes::from(vec![1u8; 5]);
        let result =
            multipart_put(&backend, "c", "id", data, &RetryPolicy::default(), &cancel).await;
        assert!(matches!(result, Err(StorageError::AuthFailed(_))));
    }
}
