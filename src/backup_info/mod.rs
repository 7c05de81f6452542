//! Backup-info store (spec §3/§4.5): the typed data model plus the
//! commit/query engine that owns one storage definition's manifest and
//! history-DB files.

pub mod history;
pub mod model;

pub use history::BackupInfoStore;
pub use model::{
    BackupType, FileRecord, HistoryDb, ProviderKind, SpecificBackup, StorageDefinition,
};
