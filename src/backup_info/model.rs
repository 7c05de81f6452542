//! Typed data model backing the backup-info store (spec §3): every on-disk
//! document is a `schema_version`-tagged structured record, never a
//! free-form map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::storage::{InterfaceKind, StorageConfig};

pub const SCHEMA_VERSION: u32 = 1;

/// Provider kind a [`StorageDefinition`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    Filesystem,
    ObjectStorage,
}

/// A named backup repository (spec §3 "StorageDefinition").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDefinition {
    pub schema_version: u32,
    pub name: String,
    pub provider_kind: ProviderKind,
    pub container: String,
    pub storage_config: StorageConfig,
    pub encryption_enabled: bool,
    pub persisted_iv: bool,
    /// Identifier resolved against the key manager's secret store; the key
    /// itself is never embedded in this document.
    pub encryption_key_ref: Option<String>,
    /// Open Question resolution: case-insensitive path normalization is
    /// forced on for Windows-style repositories regardless of the host OS,
    /// and is otherwise opt-in via this flag.
    pub case_insensitive: bool,
}

impl StorageDefinition {
    pub fn interface_kind(&self) -> InterfaceKind {
        self.storage_config.interface_kind()
    }
}

/// Backup classification driving whether a file is skipped, re-hashed and
/// compared, or unconditionally backed up (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    Full,
    Incremental,
    IncrementalPlus,
    IncrementalPlusDedup,
}

/// One entry describing a source file inside a [`SpecificBackup`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub source_path: PathBuf,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub plaintext_digest: String,
    pub ciphertext_digest: String,
    /// Present unless this record is a pure dedup reference to another
    /// record (spec §3 invariant).
    pub stored_object_id: Option<String>,
    /// Plaintext digest of the record whose stored object is reused, when
    /// this record is a dedup reference rather than a fresh upload.
    pub dedup_ref: Option<String>,
    pub encrypted: bool,
    pub iv_persisted: bool,
}

impl FileRecord {
    pub fn is_dedup_reference(&self) -> bool {
        self.dedup_ref.is_some() && self.stored_object_id.is_none()
    }
}

/// A per-file warning recorded when a previously-seen path's digest
/// changed despite matching size and mtime (spec §4.6 bitrot rule).
pub use crate::error::ClassificationWarning;

/// A labeled set of file records produced by one backup invocation (spec
/// §3 "SpecificBackup").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificBackup {
    pub schema_version: u32,
    pub label: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub backup_type: BackupType,
    pub source_roots: Vec<PathBuf>,
    pub records: Vec<FileRecord>,
    pub errors: Vec<String>,
    pub bitrot_warnings: Vec<ClassificationWarning>,
}

impl SpecificBackup {
    pub fn label_for(storage_name: &str, at: DateTime<Utc>) -> String {
        format!("{storage_name}-{}", at.format("%Y%m%d-%H%M%S"))
    }
}

/// The merged index of every `SpecificBackup` ever committed to one
/// storage definition (spec §3 "HistoryDB").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDb {
    pub schema_version: u32,
    pub backups: Vec<SpecificBackup>,
    /// normalized source path -> (backup index, record index) of the most
    /// recent FileRecord for that path.
    #[serde(default)]
    pub path_index: BTreeMap<String, (usize, usize)>,
    /// content digest -> (backup index, record index) of any FileRecord
    /// with that digest, used for dedup lookups.
    #[serde(default)]
    pub digest_index: BTreeMap<String, (usize, usize)>,
}

impl HistoryDb {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            backups: Vec::new(),
            path_index: BTreeMap::new(),
            digest_index: BTreeMap::new(),
        }
    }
}
