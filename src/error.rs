//! Error taxonomy for the backup engine.

use thiserror::Error;

/// Top-level error type returned by every engine-facing operation.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("invalid backup state: {0}")]
    InvalidState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Storage-backend specific errors, split transient/permanent per the
/// retry policy in the storage provider interface.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("network error: {0}")]
    Network(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("server error ({0})")]
    Http5xx(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("checksum mismatch for object {0}")]
    ChecksumMismatch(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),
}

impl StorageError {
    /// Whether this error category should be retried by the multipart
    /// uploader. Mirrors spec §4.3: transient categories retry forever
    /// (absent an explicit cap), permanent categories fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Network(_) | StorageError::Throttled(_) | StorageError::Http5xx(_)
        )
    }
}

/// Crypto-envelope specific errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("bad envelope magic")]
    BadMagic,

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("envelope too short to contain a header")]
    Truncated,

    #[error("authentication tag mismatch")]
    AuthFailure,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Configuration / key-manager errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found")]
    NotFound,

    #[error("bad password")]
    BadPassword,

    #[error("corrupt export")]
    CorruptExport,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Digest / integrity validation errors surfaced at restore/verify time.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("digest mismatch for {path}: expected {expected}, actual {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {path}: expected {expected}, actual {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

/// Non-fatal classification warning recorded on a specific backup but not
/// returned as an `Err` — corresponds to the `classification-warning`
/// taxonomy entry (bitrot / sneaky corruption).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassificationWarning {
    pub path: String,
    pub message: String,
    pub previous_digest: String,
    pub current_digest: String,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BackupError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
