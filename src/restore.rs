//! Restore/verify engine (spec §4.7): resolves stored objects back to
//! `FileRecord`s (following dedup references), decrypts and validates
//! against both digests recorded at backup time, and either materializes
//! files under a destination directory or just checks integrity in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::backup_info::{BackupInfoStore, FileRecord, SpecificBackup};
use crate::context::Context;
use crate::crypto::CryptoEnvelope;
use crate::digest;
use crate::error::{BackupError, Result, ValidationError};
use crate::storage::StorageBackend;

/// Outcome of one `restore` invocation.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of one `verify` invocation.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub verified: Vec<PathBuf>,
    pub mismatches: Vec<String>,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_success(&self) -> bool {
        self.mismatches.is_empty() && self.errors.is_empty()
    }
}

/// Drives restore and verify against a `BackupInfoStore` and storage
/// backend, mirroring `BackupEngine`'s shape (spec §4.7).
pub struct RestoreEngine {
    backend: Arc<dyn StorageBackend>,
    container: String,
    crypto: Option<Arc<CryptoEnvelope>>,
}

impl RestoreEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        container: impl Into<String>,
        crypto: Option<CryptoEnvelope>,
    ) -> Self {
        Self {
            backend,
            container: container.into(),
            crypto: crypto.map(Arc::new),
        }
    }

    /// Restores every record in `label` whose source path matches `glob`
    /// into `out_dir`, preserving each file's path relative to the source
    /// root it was discovered under.
    pub async fn restore(
        &self,
        store: &BackupInfoStore,
        label: &str,
        glob: &str,
        out_dir: &Path,
        ctx: &Context,
    ) -> Result<RestoreReport> {
        let backup = store.find_backup(label)?;
        let mut report = RestoreReport::default();

        for record in backup.records.iter().filter(|r| glob_matches(glob, r)) {
            if ctx.is_cancelled() {
                report.errors.push("restore cancelled".to_string());
                break;
            }
            match self.restore_one(store, backup, record, out_dir).await {
                Ok(dest) => report.restored.push(dest),
                Err(e) => {
                    warn!(path = %record.source_path.display(), error = %e, "restore failed");
                    report
                        .errors
                        .push(format!("{}: {}", record.source_path.display(), e));
                }
            }
        }
        info!(
            restored = report.restored.len(),
            errors = report.errors.len(),
            "restore complete"
        );
        Ok(report)
    }

    async fn restore_one(
        &self,
        store: &BackupInfoStore,
        backup: &SpecificBackup,
        record: &FileRecord,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        let plaintext = self.fetch_and_verify(store, record).await?;

        let rel_path = relative_to_any_root(&record.source_path, &backup.source_roots);
        let dest = out_dir.join(rel_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BackupError::Io)?;
        }
        let tmp_dest = dest.with_extension("atbu-restore-tmp");
        tokio::fs::write(&tmp_dest, &plaintext)
            .await
            .map_err(BackupError::Io)?;
        tokio::fs::rename(&tmp_dest, &dest)
            .await
            .map_err(BackupError::Io)?;
        Ok(dest)
    }

    /// Verifies every record in `label` matching `glob` against the stored
    /// object without writing anything; with `compare` also re-hashes the
    /// file still present at `record.source_path` and flags drift from the
    /// backed-up digest.
    pub async fn verify(
        &self,
        store: &BackupInfoStore,
        label: &str,
        glob: &str,
        compare: bool,
        ctx: &Context,
    ) -> Result<VerifyReport> {
        let backup = store.find_backup(label)?;
        let mut report = VerifyReport::default();

        for record in backup.records.iter().filter(|r| glob_matches(glob, r)) {
            if ctx.is_cancelled() {
                report.errors.push("verify cancelled".to_string());
                break;
            }
            match self.fetch_and_verify(store, record).await {
                Ok(plaintext) => {
                    report.verified.push(record.source_path.clone());
                    if compare {
                        self.compare_local(record, &plaintext, &mut report);
                    }
                }
                Err(e) => {
                    warn!(path = %record.source_path.display(), error = %e, "verify failed");
                    report
                        .errors
                        .push(format!("{}: {}", record.source_path.display(), e));
                }
            }
        }
        info!(
            verified = report.verified.len(),
            mismatches = report.mismatches.len(),
            errors = report.errors.len(),
            "verify complete"
        );
        Ok(report)
    }

    fn compare_local(&self, record: &FileRecord, backed_up_plaintext: &[u8], report: &mut VerifyReport) {
        match std::fs::read(&record.source_path) {
            Ok(current) => {
                let current_digest = digest::sha256(&current);
                let current_hex = hex_encode(current_digest);
                if current.len() as u64 != backed_up_plaintext.len() as u64 || current_hex != record.plaintext_digest
                {
                    report.mismatches.push(format!(
                        "{}: on-disk content no longer matches backed-up digest {} (current {})",
                        record.source_path.display(),
                        record.plaintext_digest,
                        current_hex
                    ));
                }
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("{}: {}", record.source_path.display(), e));
            }
        }
    }

    /// Resolves `record`'s stored object (following a dedup reference if
    /// necessary), fetches it, decrypts it if the repository is encrypted,
    /// and checks both digests against the record before returning the
    /// plaintext.
    async fn fetch_and_verify(&self, store: &BackupInfoStore, record: &FileRecord) -> Result<Vec<u8>> {
        let stored_object_id = self.resolve_stored_object_id(store, record)?;
        let sealed = self
            .backend
            .get_object(&self.container, &stored_object_id)
            .await
            .map_err(BackupError::Storage)?;

        let ciphertext_digest_hex = hex_encode(digest::sha256(&sealed));
        if ciphertext_digest_hex != record.ciphertext_digest {
            return Err(BackupError::Validation(ValidationError::DigestMismatch {
                path: record.source_path.display().to_string(),
                expected: record.ciphertext_digest.clone(),
                actual: ciphertext_digest_hex,
            }));
        }

        let plaintext = match &self.crypto {
            Some(envelope) => {
                let expected_digest = hex_decode(&record.plaintext_digest).ok_or_else(|| {
                    BackupError::InvalidState(format!(
                        "malformed plaintext digest recorded for {}",
                        record.source_path.display()
                    ))
                })?;
                envelope.open(&sealed, &expected_digest)?
            }
            None => sealed,
        };

        let plaintext_digest_hex = hex_encode(digest::sha256(&plaintext));
        if plaintext_digest_hex != record.plaintext_digest {
            return Err(BackupError::Validation(ValidationError::DigestMismatch {
                path: record.source_path.display().to_string(),
                expected: record.plaintext_digest.clone(),
                actual: plaintext_digest_hex,
            }));
        }
        if plaintext.len() as u64 != record.size {
            return Err(BackupError::Validation(ValidationError::SizeMismatch {
                path: record.source_path.display().to_string(),
                expected: record.size,
                actual: plaintext.len() as u64,
            }));
        }

        Ok(plaintext)
    }

    fn resolve_stored_object_id(&self, store: &BackupInfoStore, record: &FileRecord) -> Result<String> {
        if let Some(id) = &record.stored_object_id {
            return Ok(id.clone());
        }
        let dedup_digest = record.dedup_ref.as_ref().ok_or_else(|| {
            BackupError::InvalidState(format!(
                "{}: record has neither a stored object nor a dedup reference",
                record.source_path.display()
            ))
        })?;
        store
            .any_record_with_digest(dedup_digest)
            .and_then(|r| r.stored_object_id.clone())
            .ok_or_else(|| {
                BackupError::InvalidState(format!(
                    "{}: dedup target for digest {} has no stored object",
                    record.source_path.display(),
                    dedup_digest
                ))
            })
    }
}

/// Minimal `*`/`?` glob matcher, mirroring the one `BackupInfoStore` uses
/// for `files_in_backup` so restore/verify filter identically.
fn glob_matches(glob: &str, record: &FileRecord) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let text = record.source_path.to_string_lossy();
    inner(glob.as_bytes(), text.as_bytes())
}

/// Strips whichever of `roots` is a prefix of `path`, falling back to the
/// file name alone when none match (e.g. a record from a deleted source
/// root).
fn relative_to_any_root(path: &Path, roots: &[PathBuf]) -> PathBuf {
    for root in roots {
        if let Ok(rel) = path.strip_prefix(root) {
            return rel.to_path_buf();
        }
    }
    path.file_name().map(PathBuf::from).unwrap_or_else(|| path.to_path_buf())
}

fn hex_encode(bytes: [u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn hex_decode(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::model::{BackupType, ProviderKind, SCHEMA_VERSION};
    use crate::backup_info::StorageDefinition;
    use crate::engine::{BackupConfig, BackupEngine};
    use crate::keys::{InMemorySecretStore, KeyManager};
    use crate::storage::filesystem::FilesystemBackend;
    use crate::storage::StorageConfig;

    fn definition(root: &Path) -> StorageDefinition {
        StorageDefinition {
            schema_version: SCHEMA_VERSION,
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
    async fn restore_recreates_original_bytes_under_out_dir() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello, restore").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let mut store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();
        let ctx = Context::new();

        let engine = BackupEngine::new(
            backend.clone(),
            "repo".to_string(),
            None,
            BackupConfig {
                source_roots: vec![src.path().to_path_buf()],
                backup_type: BackupType::Full,
                detect_bitrot: true,
                upload_concurrency: 2,
            },
        );
        let backup = engine.run(&store, &ctx).await.unwrap();
        let label = backup.label.clone();
        store.commit(backup).unwrap();

        let restorer = RestoreEngine::new(backend, "repo".to_string(), None);
        let report = restorer
            .restore(&store, &label, "*", out_dir.path(), &ctx)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.restored.len(), 1);
        let restored_bytes = std::fs::read(out_dir.path().join("a.txt")).unwrap();
        assert_eq!(restored_bytes, b"hello, restore");
    }

    #[tokio::test]
    async fn verify_detects_corrupted_stored_object() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"integrity check").unwrap();

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let mut store = BackupInfoStore::open(config_dir.path(), definition(repo.path())).unwrap();
        let ctx = Context::new();

        let engine = BackupEngine::new(
            backend.clone(),
            "repo".to_string(),
            None,
            BackupConfig {
                source_roots: vec![src.path().to_path_buf()],
                backup_type: BackupType::Full,
                detect_bitrot: true,
                upload_concurrency: 2,
            },
        );
        let backup = engine.run(&store, &ctx).await.unwrap();
        let label = backup.label.clone();
        let object_id = backup.records[0].stored_object_id.clone().unwrap();
        store.commit(backup).unwrap();

        let object_path = repo.path().join("repo").join(&object_id);
        let mut bytes = std::fs::read(&object_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&object_path, bytes).unwrap();

        let restorer = RestoreEngine::new(backend, "repo".to_string(), None);
        let report = restorer.verify(&store, &label, "*", false, &ctx).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn encrypted_backup_wrong_key_fails_with_auth_failure() {
        let src = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("secret.txt"), b"top secret payload").unwrap();

        let key_manager = KeyManager::new(Box::new(InMemorySecretStore::new()));
        let backup_key = key_manager.create_key("s1-enc", None).unwrap();

        let mut def = definition(repo.path());
        def.name = "s1-enc".to_string();
        def.encryption_enabled = true;
        def.persisted_iv = true;
        def.encryption_key_ref = Some("s1-enc".to_string());

        let backend = Arc::new(FilesystemBackend::new(repo.path()));
        let mut store = BackupInfoStore::open(config_dir.path(), def).unwrap();
        let ctx = Context::new();

        let engine = BackupEngine::new(
            backend.clone(),
            "repo".to_string(),
            Some(CryptoEnvelope::new(&backup_key).unwrap()),
            BackupConfig {
                source_roots: vec![src.path().to_path_buf()],
                backup_type: BackupType::Full,
                detect_bitrot: true,
                upload_concurrency: 2,
            },
        );
        let backup = engine.run(&store, &ctx).await.unwrap();
        let label = backup.label.clone();
        assert!(backup.records[0].encrypted);
        store.commit(backup).unwrap();

        // A stored-object ciphertext digest mismatch (plain corruption) is
        // caught before decryption is ever attempted, so to exercise the
        // AEAD authentication-tag check itself the restorer needs the
        // wrong key against an otherwise-untampered object: same ciphertext
        // digest, failed decrypt.
        let wrong_key = CryptoEnvelope::generate_key();
        let restorer = RestoreEngine::new(backend, "repo".to_string(), Some(CryptoEnvelope::new(&wrong_key).unwrap()));
        let report = restorer.verify(&store, &label, "*", false, &ctx).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.errors.len(), 1);
        assert!(
            report.errors[0].contains("authentication tag mismatch"),
            "expected an auth-failure error, got: {}",
            report.errors[0]
        );
    }
}
