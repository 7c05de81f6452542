//! Backup engine (spec §4.6): discovers source files, classifies each
//! against prior backup history (plus duplicates seen earlier in the same
//! run), hashes and encrypts on a CPU-bound pool, uploads on an I/O-bound
//! pool with backpressure, and commits the resulting manifest.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backup_info::{BackupInfoStore, BackupType, FileRecord, SpecificBackup};
use crate::context::Context;
use crate::crypto::CryptoEnvelope;
use crate::digest::{self, DigestOutput};
use crate::error::{BackupError, ClassificationWarning, Result};
use crate::storage::retry::{multipart_put, RetryPolicy, DEFAULT_PART_SIZE};
use crate::storage::StorageBackend;

/// Inputs to one backup invocation (spec §4.6 "Inputs").
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source_roots: Vec<PathBuf>,
    pub backup_type: BackupType,
    pub detect_bitrot: bool,
    pub upload_concurrency: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_roots: Vec::new(),
            backup_type: BackupType::Incremental,
            detect_bitrot: true,
            upload_concurrency: 8,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Decision {
    Skip,
    Backup,
    Dedup,
}

struct DiscoveredFile {
    path: PathBuf,
    size: u64,
    modified_time: DateTime<Utc>,
}

/// One file after the parallel hash pool, or a file that never needed
/// hashing because a plain stat comparison already decided it (spec's
/// `incremental` row never touches file content for unchanged files).
enum Triaged {
    PreSkipped {
        path: PathBuf,
        size: u64,
        modified_time: DateTime<Utc>,
    },
    Hashed {
        path: PathBuf,
        size: u64,
        modified_time: DateTime<Utc>,
        digest: Option<DigestOutput>,
        read_error: Option<String>,
    },
}

/// A hashed (or pre-skipped) file after the sequential classification
/// decision, still awaiting upload for `Decision::Backup` files.
struct DecidedFile {
    path: PathBuf,
    size: u64,
    modified_time: DateTime<Utc>,
    digest: Option<DigestOutput>,
    decision: Decision,
    bitrot: Option<ClassificationWarning>,
    read_error: Option<String>,
}

/// A `Decision::Dedup` file waiting for every upload in this run to
/// finish, since the stored object it references may itself be uploaded
/// later in the same run.
struct PendingDedup {
    path: PathBuf,
    size: u64,
    modified_time: DateTime<Utc>,
    digest: Option<DigestOutput>,
}

/// Drives one backup invocation against a `BackupInfoStore` and storage
/// backend.
pub struct BackupEngine {
    backend: Arc<dyn StorageBackend>,
    container: String,
    crypto: Option<Arc<CryptoEnvelope>>,
    config: BackupConfig,
}

impl BackupEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        container: impl Into<String>,
        crypto: Option<CryptoEnvelope>,
        config: BackupConfig,
    ) -> Self {
        Self {
            backend,
            container: container.into(),
            crypto: crypto.map(Arc::new),
            config,
        }
    }

    /// Walks `source_roots`, classifies every discovered file against
    /// `store`'s history and against duplicates discovered earlier in this
    /// same run, hashes/encrypts/uploads as needed, and returns the
    /// `SpecificBackup` the caller should pass to `store.commit`.
    ///
    /// A cancellation observed mid-run stops enqueueing new work and
    /// returns a manifest containing only the files that completed before
    /// the signal — never a partial per-file record.
    pub async fn run(&self, store: &BackupInfoStore, ctx: &Context) -> Result<SpecificBackup> {
        let start_time = Utc::now();
        let discovered = self.discover_files()?;
        info!(count = discovered.len(), "discovered files for backup");

        let triaged = self.triage(discovered, self.config.backup_type, store);
        let decided = self.decide(triaged, self.config.backup_type, store);
        let (records, errors, bitrot_warnings) = self.upload_decided(decided, store, ctx).await;

        let end_time = Utc::now();
        info!(
            records = records.len(),
            errors = errors.len(),
            "backup run complete"
        );

        Ok(SpecificBackup {
            schema_version: crate::backup_info::model::SCHEMA_VERSION,
            label: SpecificBackup::label_for(&store.definition().name, start_time),
            start_time,
            end_time,
            backup_type: self.config.backup_type,
            source_roots: self.config.source_roots.clone(),
            records,
            errors,
            bitrot_warnings,
        })
    }

    /// Backs up this store's own history-DB file as a distinguished
    /// object labeled with a `history-db` prefix (spec §4.6 "Manifest
    /// backup"), always classifying it as `Incremental` regardless of
    /// this engine's configured `backup_type` so two back-to-back
    /// self-backups of an unchanged DB never produce more than one new
    /// stored object.
    pub async fn backup_history_db(&self, store: &BackupInfoStore, ctx: &Context) -> Result<SpecificBackup> {
        let db_path = store.history_db_path();
        let start_time = Utc::now();
        let metadata = std::fs::metadata(&db_path).map_err(BackupError::Io)?;
        let modified_time: DateTime<Utc> = metadata.modified().map_err(BackupError::Io)?.into();
        let discovered = vec![DiscoveredFile {
            path: db_path.clone(),
            size: metadata.len(),
            modified_time,
        }];

        let triaged = self.triage(discovered, BackupType::Incremental, store);
        let decided = self.decide(triaged, BackupType::Incremental, store);
        let (records, errors, bitrot_warnings) = self.upload_decided(decided, store, ctx).await;

        let end_time = Utc::now();
        info!(
            records = records.len(),
            errors = errors.len(),
            "history-db self-backup complete"
        );

        Ok(SpecificBackup {
            schema_version: crate::backup_info::model::SCHEMA_VERSION,
            label: SpecificBackup::label_for("history-db", start_time),
            start_time,
            end_time,
            backup_type: BackupType::Incremental,
            source_roots: vec![db_path],
            records,
            errors,
            bitrot_warnings,
        })
    }

    /// Uploads every `Decision::Backup` file concurrently, then resolves
    /// every `Decision::Dedup` file against this run's fresh uploads and
    /// prior history. Shared by `run` and `backup_history_db`.
    async fn upload_decided(
        &self,
        decided: Vec<DecidedFile>,
        store: &BackupInfoStore,
        ctx: &Context,
    ) -> (Vec<FileRecord>, Vec<String>, Vec<ClassificationWarning>) {
        let mut errors = Vec::new();
        let mut bitrot_warnings = Vec::new();
        let mut dedup_pending = Vec::new();
        let mut records = Vec::new();

        let semaphore = Arc::new(Semaphore::new(self.config.upload_concurrency.max(1)));
        // plaintext digest -> (ciphertext digest, stored object id) for
        // objects uploaded earlier in this same run, so same-run
        // duplicates can dedup without re-encrypting or re-uploading.
        let uploaded_this_run: Arc<dashmap::DashMap<String, (String, String)>> =
            Arc::new(dashmap::DashMap::new());
        let mut upload_futures = Vec::new();

        for file in decided {
            let DecidedFile {
                path,
                size,
                modified_time,
                digest,
                decision,
                bitrot,
                read_error,
            } = file;

            if let Some(err) = read_error {
                warn!(path = %path.display(), error = %err, "read failed, skipping file");
                errors.push(format!("{}: {}", path.display(), err));
                continue;
            }
            if let Some(warning) = bitrot {
                if self.config.detect_bitrot {
                    errors.push(format!("bitrot suspected at {}", warning.path));
                }
                bitrot_warnings.push(warning);
            }

            match decision {
                Decision::Skip => continue,
                Decision::Dedup => dedup_pending.push(PendingDedup {
                    path,
                    size,
                    modified_time,
                    digest,
                }),
                Decision::Backup => {
                    let digest_output = digest.expect("backup decision always hashes");
                    let backend = self.backend.clone();
                    let container = self.container.clone();
                    let sem = semaphore.clone();
                    let cancel = ctx.cancel.clone();
                    let crypto = self.crypto.clone();
                    let encrypted = self.crypto.is_some();
                    let plaintext_digest_hex = digest_output.plaintext_digest_hex();
                    let uploaded_map = uploaded_this_run.clone();

                    upload_futures.push(tokio::spawn(async move {
                        if cancel.is_cancelled() {
                            return Err((path, "cancelled before upload".to_string()));
                        }
                        let seal_path = path.clone();
                        let sealed = tokio::task::spawn_blocking(move || {
                            seal_and_read(&seal_path, crypto.as_deref())
                        })
                        .await;
                        let (ciphertext_bytes, ciphertext_digest_out) = match sealed {
                            Ok(Ok(pair)) => pair,
                            Ok(Err(e)) => return Err((path, e.to_string())),
                            Err(join_err) => {
                                return Err((path, format!("seal task panicked: {join_err}")))
                            }
                        };
                        let ciphertext_digest = ciphertext_digest_out.ciphertext_digest_hex();
                        let object_id = object_id_for(&ciphertext_digest);

                        let _permit = sem.acquire_owned().await.expect("semaphore closed");
                        match upload_object(&*backend, &container, &object_id, ciphertext_bytes, &cancel).await {
                            Ok(()) => {
                                debug!(
                                    path = %path.display(),
                                    plaintext_digest = %plaintext_digest_hex,
                                    ciphertext_digest = %ciphertext_digest,
                                    "uploaded object"
                                );
                                uploaded_map.insert(
                                    plaintext_digest_hex.clone(),
                                    (ciphertext_digest.clone(), object_id.clone()),
                                );
                                Ok(FileRecord {
                                    source_path: path,
                                    size,
                                    modified_time,
                                    plaintext_digest: plaintext_digest_hex,
                                    ciphertext_digest,
                                    stored_object_id: Some(object_id),
                                    dedup_ref: None,
                                    encrypted,
                                    iv_persisted: encrypted,
                                })
                            }
                            Err(e) => Err((path, e.to_string())),
                        }
                    }));
                }
            }
        }

        for handle in upload_futures {
            match handle.await {
                Ok(Ok(record)) => records.push(record),
                Ok(Err((path, msg))) => {
                    warn!(path = %path.display(), error = %msg, "upload failed");
                    errors.push(format!("{}: {}", path.display(), msg));
                }
                Err(join_err) => {
                    errors.push(format!("upload task panicked: {join_err}"));
                }
            }
        }

        // All `Uploaded` transitions have now happened; resolve dedup
        // references against both this run's fresh uploads and history.
        for pending in dedup_pending {
            let digest_output = pending.digest.expect("dedup decision always hashes");
            let plaintext_digest_hex = digest_output.plaintext_digest_hex();

            let resolved = uploaded_this_run
                .get(&plaintext_digest_hex)
                .map(|entry| entry.value().0.clone())
                .or_else(|| {
                    store
                        .any_record_with_digest(&plaintext_digest_hex)
                        .map(|r| r.ciphertext_digest.clone())
                });

            match resolved {
                Some(ciphertext_digest) => {
                    records.push(FileRecord {
                        source_path: pending.path,
                        size: pending.size,
                        modified_time: pending.modified_time,
                        plaintext_digest: plaintext_digest_hex.clone(),
                        ciphertext_digest,
                        stored_object_id: None,
                        dedup_ref: Some(plaintext_digest_hex),
                        encrypted: self.crypto.is_some(),
                        iv_persisted: self.crypto.is_some(),
                    });
                }
                None => {
                    warn!(path = %pending.path.display(), "dedup target unavailable");
                    errors.push(format!(
                        "{}: dedup target for digest {} was never uploaded",
                        pending.path.display(),
                        plaintext_digest_hex
                    ));
                }
            }
        }

        (records, errors, bitrot_warnings)
    }

    fn discover_files(&self) -> Result<Vec<DiscoveredFile>> {
        let mut out = Vec::new();
        for root in &self.config.source_roots {
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = entry.metadata().map_err(|e| BackupError::Io(e.into()))?;
                let modified_time: DateTime<Utc> = metadata.modified().map_err(BackupError::Io)?.into();
                out.push(DiscoveredFile {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified_time,
                });
            }
        }
        Ok(out)
    }

    /// CPU-bound hashing pool: plaintext-only digest, sized to hardware
    /// parallelism via rayon. Files a plain `incremental` run can skip on
    /// stat alone are never opened.
    fn triage(&self, discovered: Vec<DiscoveredFile>, backup_type: BackupType, store: &BackupInfoStore) -> Vec<Triaged> {
        discovered
            .into_par_iter()
            .map(|file| {
                let prior = store.last_record_for_path(&file.path);
                let unchanged_by_stat = prior
                    .map(|p| p.size == file.size && same_microsecond(p.modified_time, file.modified_time))
                    .unwrap_or(false);

                if backup_type == BackupType::Incremental && unchanged_by_stat {
                    return Triaged::PreSkipped {
                        path: file.path,
                        size: file.size,
                        modified_time: file.modified_time,
                    };
                }

                match std::fs::File::open(&file.path) {
                    Ok(f) => {
                        let mut sink = std::io::sink();
                        match digest::run(f, &mut sink, None) {
                            Ok(digest_output) => Triaged::Hashed {
                                path: file.path,
                                size: file.size,
                                modified_time: file.modified_time,
                                digest: Some(digest_output),
                                read_error: None,
                            },
                            Err(e) => Triaged::Hashed {
                                path: file.path,
                                size: file.size,
                                modified_time: file.modified_time,
                                digest: None,
                                read_error: Some(e.to_string()),
                            },
                        }
                    }
                    Err(e) => Triaged::Hashed {
                        path: file.path,
                        size: file.size,
                        modified_time: file.modified_time,
                        digest: None,
                        read_error: Some(e.to_string()),
                    },
                }
            })
            .collect()
    }

    /// Sequential classification pass (spec §4.6 table): cheap now that
    /// hashing already happened, and needs to run in discovery order so
    /// same-run duplicates resolve against the first occurrence.
    fn decide(&self, triaged: Vec<Triaged>, backup_type: BackupType, store: &BackupInfoStore) -> Vec<DecidedFile> {
        let mut seen_digests: HashMap<String, ()> = HashMap::new();
        let mut out = Vec::with_capacity(triaged.len());

        for item in triaged {
            let (path, size, modified_time, digest, read_error) = match item {
                Triaged::PreSkipped {
                    path,
                    size,
                    modified_time,
                } => {
                    out.push(DecidedFile {
                        path,
                        size,
                        modified_time,
                        digest: None,
                        decision: Decision::Skip,
                        bitrot: None,
                        read_error: None,
                    });
                    continue;
                }
                Triaged::Hashed {
                    path,
                    size,
                    modified_time,
                    digest,
                    read_error,
                } => (path, size, modified_time, digest, read_error),
            };

            if let Some(err) = read_error {
                out.push(DecidedFile {
                    path,
                    size,
                    modified_time,
                    digest: None,
                    decision: Decision::Skip,
                    bitrot: None,
                    read_error: Some(err),
                });
                continue;
            }

            let digest_output = digest.expect("hashed file always has a digest when read succeeds");
            let digest_hex = digest_output.plaintext_digest_hex();
            let prior = store.last_record_for_path(&path);

            let mut decision = Decision::Backup;
            let mut bitrot = None;

            if matches!(
                backup_type,
                BackupType::IncrementalPlus | BackupType::IncrementalPlusDedup
            ) {
                if let Some(prior_record) = prior {
                    let unchanged_by_stat = prior_record.size == size
                        && same_microsecond(prior_record.modified_time, modified_time);
                    if unchanged_by_stat {
                        if prior_record.plaintext_digest == digest_hex {
                            decision = Decision::Skip;
                        } else {
                            bitrot = Some(ClassificationWarning {
                                path: path.to_string_lossy().to_string(),
                                message: "size and mtime matched prior record but digest differs"
                                    .to_string(),
                                previous_digest: prior_record.plaintext_digest.clone(),
                                current_digest: digest_hex.clone(),
                            });
                        }
                    }
                }
            }

            if decision == Decision::Backup && backup_type == BackupType::IncrementalPlusDedup {
                let dedup_hit =
                    store.any_record_with_digest(&digest_hex).is_some() || seen_digests.contains_key(&digest_hex);
                if dedup_hit {
                    decision = Decision::Dedup;
                }
            }

            if decision == Decision::Backup {
                seen_digests.insert(digest_hex, ());
            }

            out.push(DecidedFile {
                path,
                size,
                modified_time,
                digest: Some(digest_output),
                decision,
                bitrot,
                read_error: None,
            });
        }
        out
    }
}

fn same_microsecond(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp_micros() == b.timestamp_micros()
}

pub fn object_id_for(ciphertext_digest_hex: &str) -> String {
    format!("{}/{}", &ciphertext_digest_hex[..2], ciphertext_digest_hex)
}

/// Re-reads `path` and seals it through `crypto` (or passes plaintext
/// through unchanged), producing the exact bytes that will be uploaded and
/// a `DigestOutput` whose `ciphertext_digest` matches them. Runs on the
/// blocking pool since AEAD sealing is CPU-bound.
fn seal_and_read(path: &Path, crypto: Option<&CryptoEnvelope>) -> Result<(Bytes, DigestOutput)> {
    let f = std::fs::File::open(path).map_err(BackupError::Io)?;
    let mut buf = Vec::new();
    let digest_output = digest::run(f, &mut buf, crypto)?;
    Ok((Bytes::from(buf), digest_output))
}

async fn upload_object(
    backend: &dyn StorageBackend,
    container: &str,
    id: &str,
    data: Bytes,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<()> {
    let policy = RetryPolicy::default();
    if data.len() > DEFAULT_PART_SIZE {
        multipart_put(backend, container, id, data, &policy, cancel)
            .await
            .map_err(BackupError::Storage)
    } else {
        let size = data.len() as u64;
        crate::storage::retry::retry(&policy, cancel, || {
            let data = data.clone();
            async move { backend.put_object(container, id, data, size).await }
        })
        .await
        .map_err(BackupError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::model::{ProviderKind, StorageDefinition};
    use crate::storage::filesystem::FilesystemBackend;
    use crate::storage::StorageConfig;

    fn definition(root: &Path) -> StorageDefinition {
        StorageDefinition {
            schema_version: crate::backup_info::model::SCHEMA_VERSION,
            name: "s1".to_string(),
            provider_kind: ProviderKind::Filesystem,
            container: "repo".to_string(),
            storage_config: StorageConfig::Filesystem {
                root: root.to_string_lossy().to_string(),
            },
            encryption_enabled: false,
            persisted_iv: false,
            encryption_key_ref: None,
            case_insensitive: false,
        }
    }

    #[tokio::test]
    async fn full_backup_uploads_every_file() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(src.path().join("b.txt"), b"world").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();

        let engine = BackupEngine::new(
            backend,
            "repo".to_string(),
            None,
            BackupConfig {
                source_roots: vec![src.path().to_path_buf()],
                backup_type: BackupType::Full,
                detect_bitrot: true,
                upload_concurrency: 4,
            },
        );
        let ctx = Context::new();
        let backup = engine.run(&store, &ctx).await.unwrap();
        assert_eq!(backup.records.len(), 2);
        assert!(backup.errors.is_empty());
        assert!(backup.records.iter().all(|r| r.stored_object_id.is_some()));
    }

    #[tokio::test]
    async fn incremental_backup_skips_unchanged_files() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let mut store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();

        let make_engine = |backend: Arc<FilesystemBackend>| {
            BackupEngine::new(
                backend,
                "repo".to_string(),
                None,
                BackupConfig {
                    source_roots: vec![src.path().to_path_buf()],
                    backup_type: BackupType::Incremental,
                    detect_bitrot: true,
                    upload_concurrency: 4,
                },
            )
        };

        let ctx = Context::new();
        let first = make_engine(backend.clone()).run(&store, &ctx).await.unwrap();
        assert_eq!(first.records.len(), 1);
        store.commit(first).unwrap();

        let second = make_engine(backend.clone()).run(&store, &ctx).await.unwrap();
        assert_eq!(second.records.len(), 0);
    }

    #[tokio::test]
    async fn incremental_plus_dedup_references_matching_digest_within_one_run() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"same content").unwrap();
        std::fs::write(src.path().join("b.txt"), b"same content").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();

        let engine = BackupEngine::new(
            backend,
            "repo".to_string(),
            None,
            BackupConfig {
                source_roots: vec![src.path().to_path_buf()],
                backup_type: BackupType::IncrementalPlusDedup,
                detect_bitrot: true,
                upload_concurrency: 4,
            },
        );
        let ctx = Context::new();
        let backup = engine.run(&store, &ctx).await.unwrap();
        assert_eq!(backup.records.len(), 2);
        assert!(backup.errors.is_empty());
        let dedup_count = backup.records.iter().filter(|r| r.dedup_ref.is_some()).count();
        assert_eq!(dedup_count, 1);
        let uploaded_count = backup
            .records
            .iter()
            .filter(|r| r.stored_object_id.is_some())
            .count();
        assert_eq!(uploaded_count, 1);
    }

    #[tokio::test]
    async fn incremental_plus_flags_bitrot_but_still_backs_up() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let file_path = src.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let mut store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();

        let make_engine = |backend: Arc<FilesystemBackend>, backup_type| {
            BackupEngine::new(
                backend,
                "repo".to_string(),
                None,
                BackupConfig {
                    source_roots: vec![src.path().to_path_buf()],
                    backup_type,
                    detect_bitrot: true,
                    upload_concurrency: 4,
                },
            )
        };

        let ctx = Context::new();
        let first = make_engine(backend.clone(), BackupType::IncrementalPlus)
            .run(&store, &ctx)
            .await
            .unwrap();
        let original_mtime = first.records[0].modified_time;
        store.commit(first).unwrap();

        // Change content but restore the original mtime, simulating bitrot.
        std::fs::write(&file_path, b"HELLO").unwrap();
        let ft = filetime::FileTime::from_unix_time(
            original_mtime.timestamp(),
            original_mtime.timestamp_subsec_nanos(),
        );
        filetime::set_file_mtime(&file_path, ft).unwrap();

        let second = make_engine(backend.clone(), BackupType::IncrementalPlus)
            .run(&store, &ctx)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.bitrot_warnings.len(), 1);
        assert_eq!(second.errors.len(), 1);
    }
}
