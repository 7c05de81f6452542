//! # atbu-rs
//!
//! A content-addressed backup engine: full, incremental, and
//! digest-based-incremental backups with optional deduplication, silent
//! corruption ("bitrot") detection, AES-256-GCM encrypted storage, and a
//! restore/verify engine with end-to-end integrity checks. A sibling
//! persistent-file-info facility tracks and diffs per-file content
//! digests across arbitrary locations, independent of any backup
//! repository.
//!
//! ## Architecture
//!
//! - `digest`: chunked SHA-256 pipeline shared by every component that
//!   needs to hash a file.
//! - `crypto`: the AES-256-GCM envelope format for stored objects.
//! - `storage`: the provider-agnostic object interface (filesystem, S3,
//!   a generic cloud backend) plus retrying multipart upload.
//! - `keys`: platform secret store access and password-protected
//!   export/import of a storage definition's encryption key.
//! - `backup_info`: the per-storage-definition history DB and
//!   single-backup manifest format.
//! - `engine`: discovery, classification, hashing, encryption, and
//!   upload scheduling for one backup run.
//! - `restore`: materializes a manifest back to a local tree, or checks
//!   it in place.
//! - `persistent_info`: per-directory or per-file digest tracking and
//!   A-vs-B diff, unrelated to the backup repository above.
//! - `context`: cooperative cancellation threaded through every engine.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use atbu_rs::backup_info::{BackupInfoStore, BackupType, ProviderKind, StorageDefinition};
//! use atbu_rs::engine::{BackupConfig, BackupEngine};
//! use atbu_rs::storage::filesystem::FilesystemBackend;
//! use atbu_rs::storage::StorageConfig;
//! use atbu_rs::Context;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = StorageDefinition {
//!     schema_version: 1,
//!     name: "photos".to_string(),
//!     provider_kind: ProviderKind::Filesystem,
//!     container: "repo".to_string(),
//!     storage_config: StorageConfig::Filesystem { root: "/tmp/atbu-repo".to_string() },
//!     encryption_enabled: false,
//!     persisted_iv: false,
//!     encryption_key_ref: None,
//!     case_insensitive: false,
//! };
//! let mut store = BackupInfoStore::open("/tmp/atbu-info", definition.clone())?;
//!
//! let backend = Arc::new(FilesystemBackend::new("/tmp/atbu-repo"));
//! let engine = BackupEngine::new(
//!     backend,
//!     definition.container.clone(),
//!     None,
//!     BackupConfig {
//!         source_roots: vec![PathBuf::from("/tmp/photos")],
//!         backup_type: BackupType::Incremental,
//!         detect_bitrot: true,
//!         upload_concurrency: 8,
//!     },
//! );
//! let ctx = Context::new();
//! let manifest = engine.run(&store, &ctx).await?;
//! store.commit(manifest)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(dead_code)]

pub mod backup_info;
pub mod context;
pub mod crypto;
pub mod digest;
pub mod engine;
pub mod error;
pub mod keys;
pub mod persistent_info;
pub mod restore;
pub mod storage;

pub use backup_info::{BackupInfoStore, BackupType, FileRecord, HistoryDb, SpecificBackup, StorageDefinition};
pub use context::Context;
pub use crypto::CryptoEnvelope;
pub use digest::DigestOutput;
pub use engine::{BackupConfig, BackupEngine};
pub use error::{BackupError, Result};
pub use keys::{KeyManager, SecretStore};
pub use persistent_info::{ChangeDetectionType, PersistentFileInfo, PersistentInfoSink};
pub use restore::{RestoreEngine, RestoreReport, VerifyReport};
pub use storage::{StorageBackend, StorageConfig};

/// Crate version, exposed for the CLI's `--version` output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types and traits.
pub mod prelude {
    //! Commonly used types and traits.

    pub use crate::backup_info::{BackupInfoStore, BackupType, FileRecord, SpecificBackup, StorageDefinition};
    pub use crate::context::Context;
    pub use crate::crypto::CryptoEnvelope;
    pub use crate::engine::{BackupConfig, BackupEngine};
    pub use crate::error::{BackupError, Result};
    pub use crate::restore::RestoreEngine;
    pub use crate::storage::StorageConfig;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_non_empty() {
        assert!(!VERSION.is_empty());
    }
}
