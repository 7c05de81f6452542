//! Persistent-info / diff engine (spec §4.8): tracks per-file content
//! digests across one or more locations, independent of any backup
//! repository, and diffs two such locations by digest.
//!
//! The two on-disk shapes (one DB file at a directory root, or a sidecar
//! beside every data file) are modeled behind one [`PersistentInfoSink`]
//! trait so `update_digests`/`diff` never branch on shape.

pub mod diff;
pub mod per_dir;
pub mod per_file;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use diff::{diff, DiffAction, DiffReport};
pub use per_dir::PerDirSink;
pub use per_file::PerFileSink;

/// One content-digest observation of a file at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub digest: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

/// A file's current digest record plus its append-only observation
/// history (spec §3 "PersistentFileInfo").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentFileInfo {
    pub current: Observation,
    #[serde(default)]
    pub history: Vec<Observation>,
}

impl PersistentFileInfo {
    fn first(observation: Observation) -> Self {
        Self {
            current: observation,
            history: Vec::new(),
        }
    }

    /// Appends the current observation to history and installs `next` as
    /// current. The prior digest survives only in `history` from this
    /// point on (spec's one-shot sneaky-corruption detection note).
    fn advance(&mut self, next: Observation) {
        let prior = std::mem::replace(&mut self.current, next);
        self.history.push(prior);
    }
}

/// Change-detection policy driving `update_digests` (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetectionType {
    /// Recompute the digest only when size or mtime changed.
    DateSize,
    /// Always recompute the digest and compare, flagging sneaky
    /// corruption when size+mtime matched but the digest didn't.
    Digest,
}

/// A file whose digest changed despite matching size and mtime — the
/// per-file-info analogue of the backup engine's bitrot warning.
#[derive(Debug, Clone)]
pub struct SneakyCorruptionWarning {
    pub path: PathBuf,
    pub previous_digest: String,
    pub current_digest: String,
}

/// Outcome of one `update_digests` invocation.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub updated: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub sneaky_corruption: Vec<SneakyCorruptionWarning>,
    pub errors: Vec<String>,
}

/// Abstract persistence shape for a location's digest records (spec's
/// "single abstract persistence sink" design note).
pub trait PersistentInfoSink {
    /// Root directory this sink covers.
    fn root(&self) -> &Path;

    /// Loads every record currently persisted under this sink, keyed by
    /// path relative to `root()`.
    fn load(&self) -> Result<BTreeMap<PathBuf, PersistentFileInfo>>;

    /// Persists `records`, replacing whatever this sink previously held
    /// for the paths present in the map.
    fn save(&self, records: &BTreeMap<PathBuf, PersistentFileInfo>) -> Result<()>;

    /// Every regular data file under `root()`, excluding whatever this
    /// sink shape uses to store its own records (DB file or sidecars).
    fn discover_data_files(&self) -> Result<Vec<PathBuf>>;

    /// Removes the data file at `rel` (relative to `root()`) and any
    /// shape-specific sidecar. The per-dir shape has no sidecar to clean
    /// up; `PerFileSink` overrides this to also remove `<name>.atbu`.
    fn remove_data_file(&self, rel: &Path) -> Result<()> {
        let path = self.root().join(rel);
        if path.exists() {
            std::fs::remove_file(&path).map_err(crate::error::BackupError::Io)?;
        }
        Ok(())
    }

    /// Moves the data file at `rel` into `dest_root`, preserving `rel`,
    /// and moves any shape-specific sidecar alongside it.
    fn move_data_file(&self, rel: &Path, dest_root: &Path) -> Result<()> {
        let src = self.root().join(rel);
        let dest = dest_root.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(crate::error::BackupError::Io)?;
        }
        std::fs::rename(&src, &dest).map_err(crate::error::BackupError::Io)?;
        Ok(())
    }
}

/// Walks `sink`'s location and brings its persisted records up to date
/// under `cdt` (spec §4.8 "update-digests").
pub fn update_digests(sink: &dyn PersistentInfoSink, cdt: ChangeDetectionType) -> Result<UpdateReport> {
    let mut records = sink.load()?;
    let mut report = UpdateReport::default();
    let now = Utc::now();

    for abs_path in sink.discover_data_files()? {
        let rel_path = match abs_path.strip_prefix(sink.root()) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => abs_path.clone(),
        };

        let metadata = match std::fs::metadata(&abs_path) {
            Ok(m) => m,
            Err(e) => {
                report.errors.push(format!("{}: {}", abs_path.display(), e));
                continue;
            }
        };
        let size = metadata.len();
        let modified_time: DateTime<Utc> = match metadata.modified() {
            Ok(m) => m.into(),
            Err(e) => {
                report.errors.push(format!("{}: {}", abs_path.display(), e));
                continue;
            }
        };

        let existing = records.get(&rel_path);
        let stat_matches = existing
            .map(|r| r.current.size == size && r.current.modified_time.timestamp_micros() == modified_time.timestamp_micros())
            .unwrap_or(false);

        let needs_digest = match (cdt, existing) {
            (_, None) => true,
            (ChangeDetectionType::DateSize, Some(_)) => !stat_matches,
            (ChangeDetectionType::Digest, Some(_)) => true,
        };

        if !needs_digest {
            report.unchanged.push(rel_path);
            continue;
        }

        let digest_hex = match hash_file(&abs_path) {
            Ok(d) => d,
            Err(e) => {
                report.errors.push(format!("{}: {}", abs_path.display(), e));
                continue;
            }
        };

        let next = Observation {
            digest: digest_hex.clone(),
            size,
            modified_time,
            observed_at: now,
        };

        match records.get_mut(&rel_path) {
            Some(record) => {
                if cdt == ChangeDetectionType::Digest && stat_matches && record.current.digest != digest_hex {
                    report.sneaky_corruption.push(SneakyCorruptionWarning {
                        path: rel_path.clone(),
                        previous_digest: record.current.digest.clone(),
                        current_digest: digest_hex.clone(),
                    });
                }
                if record.current.digest != digest_hex
                    || record.current.size != size
                    || record.current.modified_time.timestamp_micros() != modified_time.timestamp_micros()
                {
                    record.advance(next);
                    report.updated.push(rel_path);
                } else {
                    report.unchanged.push(rel_path);
                }
            }
            None => {
                records.insert(rel_path.clone(), PersistentFileInfo::first(next));
                report.updated.push(rel_path);
            }
        }
    }

    sink.save(&records)?;
    Ok(report)
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let f = std::fs::File::open(path)?;
    let mut sink = std::io::sink();
    let output = crate::digest::run(f, &mut sink, None)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(output.plaintext_digest_hex())
}

/// Materializes one or more locations' current state into a single JSON
/// database file (spec §4.8 "save-db"). An input path that already points
/// at a saved DB file is treated as a pre-collected location and its
/// records are merged in under their own relative-path namespace.
pub fn save_db(locations: &[Box<dyn PersistentInfoSink>], db_path: &Path) -> Result<()> {
    let mut merged: BTreeMap<String, PersistentFileInfo> = BTreeMap::new();
    for location in locations {
        let records = location.load()?;
        let prefix = location.root().to_string_lossy().replace('\\', "/");
        for (rel, info) in records {
            let key = format!("{prefix}/{}", rel.to_string_lossy().replace('\\', "/"));
            merged.insert(key, info);
        }
    }
    let bytes = serde_json::to_vec_pretty(&merged)?;
    std::fs::write(db_path, bytes).map_err(crate::error::BackupError::Io)?;
    Ok(())
}
