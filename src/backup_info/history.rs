//! Backup-info store: owns one [`StorageDefinition`]'s on-disk manifest and
//! history-DB artifacts and implements the commit protocol of spec §4.5.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use super::model::{FileRecord, HistoryDb, SpecificBackup, StorageDefinition, SCHEMA_VERSION};
use crate::error::{BackupError, Result};

fn normalize_path(path: &Path, case_insensitive: bool) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if case_insensitive || cfg!(windows) {
        s.to_lowercase()
    } else {
        s
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(BackupError::Io)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path).map_err(BackupError::Io)?;
        use std::io::Write;
        f.write_all(bytes).map_err(BackupError::Io)?;
        f.sync_all().map_err(BackupError::Io)?;
    }
    fs::rename(&tmp_path, path).map_err(BackupError::Io)?;
    Ok(())
}

/// Owns one `StorageDefinition`'s manifest and history-DB files under a
/// user config directory.
pub struct BackupInfoStore {
    config_dir: PathBuf,
    definition: StorageDefinition,
    history: HistoryDb,
}

impl BackupInfoStore {
    /// Open (or initialize) the store for `definition` under `config_dir`
    /// (normally `<user-config>/backup-info`).
    pub fn open(config_dir: impl Into<PathBuf>, definition: StorageDefinition) -> Result<Self> {
        let config_dir = config_dir.into();
        let history_path = Self::history_path_for(&config_dir, &definition.name);
        let history = if history_path.exists() {
            let bytes = fs::read(&history_path).map_err(BackupError::Io)?;
            serde_json::from_slice(&bytes)?
        } else {
            HistoryDb::new()
        };
        Ok(Self {
            config_dir,
            definition,
            history,
        })
    }

    fn history_path_for(config_dir: &Path, storage_name: &str) -> PathBuf {
        config_dir.join(format!("{storage_name}.atbuinf"))
    }

    fn manifest_path(&self, label: &str) -> PathBuf {
        self.config_dir
            .join(format!("{}-{label}.atbuinf", self.definition.name))
    }

    pub fn definition(&self) -> &StorageDefinition {
        &self.definition
    }

    pub fn history(&self) -> &HistoryDb {
        &self.history
    }

    /// Implements the commit protocol of spec §4.5: write the per-backup
    /// manifest (`<label>.tmp` -> fsync -> rename), merge it into the
    /// in-memory history, write the history DB (`<storage>.tmp` -> fsync ->
    /// rename). Does not drive the history-DB self-backup step (spec
    /// §4.6's "manifest backup") — use [`Self::commit_with_self_backup`]
    /// for that.
    pub fn commit(&mut self, manifest: SpecificBackup) -> Result<()> {
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&self.manifest_path(&manifest.label), &manifest_bytes)?;

        let backup_index = self.history.backups.len();
        for (record_index, record) in manifest.records.iter().enumerate() {
            let key = normalize_path(&record.source_path, self.definition.case_insensitive);
            self.history
                .path_index
                .insert(key, (backup_index, record_index));
            self.history
                .digest_index
                .entry(record.plaintext_digest.clone())
                .or_insert((backup_index, record_index));
        }
        self.history.backups.push(manifest);
        self.history.schema_version = SCHEMA_VERSION;

        let history_bytes = serde_json::to_vec_pretty(&self.history)?;
        write_atomic(
            &Self::history_path_for(&self.config_dir, &self.definition.name),
            &history_bytes,
        )?;
        Ok(())
    }

    pub fn history_db_path(&self) -> PathBuf {
        Self::history_path_for(&self.config_dir, &self.definition.name)
    }

    /// Commits `manifest`, then drives a self-backup of this store's own
    /// history-DB file through `engine` (spec §4.6 "Manifest backup"):
    /// `engine.backup_history_db` always classifies that file as
    /// `Incremental` regardless of `manifest`'s own `backup_type`, so two
    /// back-to-back self-backups of an unchanged DB commit at most one new
    /// stored object. The self-backup's own manifest is committed too, so
    /// its `FileRecord` becomes the baseline the next self-backup compares
    /// against.
    pub async fn commit_with_self_backup(
        &mut self,
        manifest: SpecificBackup,
        engine: &crate::engine::BackupEngine,
        ctx: &crate::context::Context,
    ) -> Result<()> {
        self.commit(manifest)?;
        let self_manifest = engine.backup_history_db(&*self, ctx).await?;
        self.commit(self_manifest)
    }

    /// Most recent `FileRecord` committed for `path`, if any.
    pub fn last_record_for_path(&self, path: &Path) -> Option<&FileRecord> {
        let key = normalize_path(path, self.definition.case_insensitive);
        let (backup_idx, record_idx) = *self.history.path_index.get(&key)?;
        self.history
            .backups
            .get(backup_idx)
            .and_then(|b| b.records.get(record_idx))
    }

    /// Any `FileRecord` sharing `digest_hex`, used for dedup lookups.
    pub fn any_record_with_digest(&self, digest_hex: &str) -> Option<&FileRecord> {
        let (backup_idx, record_idx) = *self.history.digest_index.get(digest_hex)?;
        self.history
            .backups
            .get(backup_idx)
            .and_then(|b| b.records.get(record_idx))
    }

    /// Labels of every committed backup, newest first.
    pub fn list_backup_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.history.backups.iter().map(|b| b.label.clone()).collect();
        labels.reverse();
        labels
    }

    /// Resolves `label_or_last` (the literal `"last"` means the most
    /// recently committed backup) to its `SpecificBackup`.
    pub fn find_backup(&self, label_or_last: &str) -> Result<&SpecificBackup> {
        if label_or_last == "last" {
            return self
                .history
                .backups
                .last()
                .ok_or_else(|| BackupError::BackupNotFound("last".to_string()));
        }
        self.history
            .backups
            .iter()
            .find(|b| b.label == label_or_last)
            .ok_or_else(|| BackupError::BackupNotFound(label_or_last.to_string()))
    }

    /// Records in `label` whose source path matches `glob` (a simple
    /// `*`/`?` glob, not a full regex).
    pub fn files_in_backup(&self, label: &str, glob: &str) -> Result<Vec<&FileRecord>> {
        let backup = self.find_backup(label)?;
        Ok(backup
            .records
            .iter()
            .filter(|r| glob_match(glob, &r.source_path.to_string_lossy()))
            .collect())
    }

    pub fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }
}

/// Minimal `*`/`?` glob matcher, sufficient for path-pattern filtering
/// without pulling in a dedicated glob crate for one call site.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_info::model::ProviderKind;
    use crate::storage::StorageConfig;

    fn test_definition(name: &str, case_insensitive: bool) -> StorageDefinition {
        StorageDefinition {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            provider_kind: ProviderKind::Filesystem,
            container: "repo".to_string(),
            storage_config: StorageConfig::Filesystem {
                root: "/tmp/repo".to_string(),
            },
            encryption_enabled: false,
            persisted_iv: false,
            encryption_key_ref: None,
            case_insensitive,
        }
    }

    fn test_record(path: &str, digest: &str) -> FileRecord {
        FileRecord {
            source_path: PathBuf::from(path),
            size: 10,
            modified_time: Utc::now(),
            plaintext_digest: digest.to_string(),
            ciphertext_digest: digest.to_string(),
            stored_object_id: Some(format!("{}/{}", &digest[..2], digest)),
            dedup_ref: None,
            encrypted: false,
            iv_persisted: false,
        }
    }

    fn test_backup(label: &str, records: Vec<FileRecord>) -> SpecificBackup {
        SpecificBackup {
            schema_version: SCHEMA_VERSION,
            label: label.to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            backup_type: super::super::model::BackupType::Full,
            source_roots: vec![PathBuf::from("/src")],
            records,
            errors: Vec::new(),
            bitrot_warnings: Vec::new(),
        }
    }

    #[test]
    fn commit_then_query_by_path_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        let record = test_record("/src/a.txt", "deadbeef");
        store.commit(test_backup("s1-20260101-000000", vec![record])).unwrap();

        assert!(store.last_record_for_path(Path::new("/src/a.txt")).is_some());
        assert!(store.any_record_with_digest("deadbeef").is_some());
        assert_eq!(store.list_backup_labels(), vec!["s1-20260101-000000"]);
    }

    #[test]
    fn digest_index_is_monotonically_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        store
            .commit(test_backup("s1-1", vec![test_record("/a", "d1")]))
            .unwrap();
        let first_count = store.history().digest_index.len();
        store
            .commit(test_backup("s1-2", vec![test_record("/b", "d2")]))
            .unwrap();
        let second_count = store.history().digest_index.len();
        assert!(second_count >= first_count);
        assert!(store.any_record_with_digest("d1").is_some());
        assert!(store.any_record_with_digest("d2").is_some());
    }

    #[test]
    fn case_insensitive_normalization_matches_mixed_case_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", true)).unwrap();
        store
            .commit(test_backup("s1-1", vec![test_record("/Src/A.txt", "d1")]))
            .unwrap();
        assert!(store
            .last_record_for_path(Path::new("/src/a.TXT"))
            .is_some());
    }

    #[test]
    fn case_sensitive_by_default_does_not_match_mixed_case() {
        if cfg!(windows) {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        store
            .commit(test_backup("s1-1", vec![test_record("/Src/A.txt", "d1")]))
            .unwrap();
        assert!(store
            .last_record_for_path(Path::new("/src/a.txt"))
            .is_none());
    }

    #[test]
    fn find_backup_resolves_last_literal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        store.commit(test_backup("s1-1", vec![])).unwrap();
        store.commit(test_backup("s1-2", vec![])).unwrap();
        assert_eq!(store.find_backup("last").unwrap().label, "s1-2");
    }

    #[test]
    fn files_in_backup_filters_by_glob() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        store
            .commit(test_backup(
                "s1-1",
                vec![test_record("/src/a.txt", "d1"), test_record("/src/b.log", "d2")],
            ))
            .unwrap();
        let matches = store.files_in_backup("s1-1", "*.txt").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].source_path, PathBuf::from("/src/a.txt"));
    }

    #[test]
    fn reopening_store_reloads_committed_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
            store
                .commit(test_backup("s1-1", vec![test_record("/a", "d1")]))
                .unwrap();
        }
        let reopened = BackupInfoStore::open(dir.path(), test_definition("s1", false)).unwrap();
        assert!(reopened.any_record_with_digest("d1").is_some());
    }
}
