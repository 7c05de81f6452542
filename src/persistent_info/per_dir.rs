//! Per-directory persistence shape (spec §4.8 "per-dir"): one JSON
//! database file at the location root, keyed by path relative to it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{PersistentFileInfo, PersistentInfoSink};
use crate::error::{BackupError, Result};

const DB_FILE_NAME: &str = ".atbu-persistent-info.json";

pub struct PerDirSink {
    root: PathBuf,
}

impl PerDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE_NAME)
    }
}

impl PersistentInfoSink for PerDirSink {
    fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self) -> Result<BTreeMap<PathBuf, PersistentFileInfo>> {
        let path = self.db_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path).map_err(BackupError::Io)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save(&self, records: &BTreeMap<PathBuf, PersistentFileInfo>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let path = self.db_path();
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).map_err(BackupError::Io)?;
        fs::rename(&tmp_path, &path).map_err(BackupError::Io)?;
        Ok(())
    }

    fn discover_data_files(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name() == DB_FILE_NAME {
                continue;
            }
            out.push(entry.path().to_path_buf());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistent_info::{update_digests, ChangeDetectionType};

    #[test]
    fn update_digests_records_every_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"one").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"two").unwrap();

        let sink = PerDirSink::new(dir.path());
        let report = update_digests(&sink, ChangeDetectionType::DateSize).unwrap();
        assert_eq!(report.updated.len(), 2);
        assert!(report.errors.is_empty());

        let records = sink.load().unwrap();
        assert_eq!(records.len(), 2);
        assert!(dir.path().join(DB_FILE_NAME).exists());
    }

    #[test]
    fn datesize_skips_rehash_when_stat_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"content").unwrap();
        let sink = PerDirSink::new(dir.path());
        update_digests(&sink, ChangeDetectionType::DateSize).unwrap();

        let second = update_digests(&sink, ChangeDetectionType::DateSize).unwrap();
        assert_eq!(second.unchanged.len(), 1);
        assert!(second.updated.is_empty());
    }

    #[test]
    fn digest_cdt_flags_sneaky_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"content").unwrap();
        let sink = PerDirSink::new(dir.path());
        let first = update_digests(&sink, ChangeDetectionType::DateSize).unwrap();
        let original_mtime = first.updated.is_empty();
        let _ = original_mtime;

        let meta = std::fs::metadata(&file_path).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);

        std::fs::write(&file_path, b"corrupt").unwrap();
        filetime::set_file_mtime(&file_path, mtime).unwrap();

        let second = update_digests(&sink, ChangeDetectionType::Digest).unwrap();
        assert_eq!(second.sneaky_corruption.len(), 1);
    }
}
