//! Key/credential manager (spec §4.4): a platform-backed secret store plus
//! password-wrapped export/import of the per-storage encryption key.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng as AeadOsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as b64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::crypto::CryptoEnvelope;
use crate::error::{ConfigError, ConfigResult};

const ENCRYPTION_KEY_USERNAME: &str = "encryption-key";
const EXPORT_SCHEMA_VERSION: u32 = 1;
const HMAC_KEY: &[u8] = b"atbu-rs-export-integrity-v1";

/// Platform credential store abstraction. `InMemorySecretStore` backs every
/// test in this crate; `KeyringSecretStore` is the production
/// implementation used by the CLI.
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, username: &str) -> ConfigResult<Option<Vec<u8>>>;
    fn set(&self, service: &str, username: &str, secret: &[u8]) -> ConfigResult<()>;
    fn delete(&self, service: &str, username: &str) -> ConfigResult<()>;
}

/// Backed by the OS credential store (Keychain / Secret Service / Windows
/// Credential Manager) via the `keyring` crate.
pub struct KeyringSecretStore;

impl SecretStore for KeyringSecretStore {
    fn get(&self, service: &str, username: &str) -> ConfigResult<Option<Vec<u8>>> {
        let entry = keyring::Entry::new(service, username)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        match entry.get_password() {
            Ok(encoded) => Ok(Some(
                b64.decode(encoded).map_err(|_| ConfigError::CorruptExport)?,
            )),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(ConfigError::Invalid(e.to_string())),
        }
    }

    fn set(&self, service: &str, username: &str, secret: &[u8]) -> ConfigResult<()> {
        let entry = keyring::Entry::new(service, username)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        entry
            .set_password(&b64.encode(secret))
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn delete(&self, service: &str, username: &str) -> ConfigResult<()> {
        let entry = keyring::Entry::new(service, username)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(ConfigError::Invalid(e.to_string())),
        }
    }
}

/// In-memory secret store used by tests and by any caller that does not
/// want to touch the platform keyring.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, service: &str, username: &str) -> ConfigResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(&(service.to_string(), username.to_string()))
            .cloned())
    }

    fn set(&self, service: &str, username: &str, secret: &[u8]) -> ConfigResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert((service.to_string(), username.to_string()), secret.to_vec());
        Ok(())
    }

    fn delete(&self, service: &str, username: &str) -> ConfigResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&(service.to_string(), username.to_string()));
        Ok(())
    }
}

/// Hook for a hardware key wrapper (e.g. YubiKey). No concrete
/// implementation ships in this crate; a `KeyManager` configured with one
/// would call it to additionally wrap/unwrap the data key.
pub trait KeyWrapper: Send + Sync {
    fn wrap(&self, key: &[u8]) -> ConfigResult<Vec<u8>>;
    fn unwrap(&self, wrapped: &[u8]) -> ConfigResult<Vec<u8>>;
}

#[derive(Serialize, Deserialize)]
struct ExportDocument {
    schema_version: u32,
    storage_name: String,
    password_protected: bool,
    salt_b64: Option<String>,
    key_b64: String,
    signature_b64: String,
}

/// Owns one `SecretStore` and drives key creation, unlock, export, and
/// import for a named storage definition.
pub struct KeyManager {
    store: Box<dyn SecretStore>,
}

impl KeyManager {
    pub fn new(store: Box<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Generate a random 256-bit data key and persist it under
    /// `storage_name` in the secret store. When `password` is given, the
    /// key is wrapped before storage so `unlock` must later be called with
    /// the same password.
    pub fn create_key(&self, storage_name: &str, password: Option<&str>) -> ConfigResult<Vec<u8>> {
        let key = CryptoEnvelope::generate_key();
        let stored = match password {
            None => key.to_vec(),
            Some(pw) => wrap_with_password(&key, pw, &wrap_salt(storage_name))?,
        };
        self.store
            .set(storage_name, ENCRYPTION_KEY_USERNAME, &stored)?;
        Ok(key.to_vec())
    }

    /// Fetch the stored data key. If `password` is given, the returned
    /// bytes are additionally unwrapped through an AES-GCM envelope keyed
    /// by an Argon2-derived key from the password, rather than treating
    /// the password-derived bytes as the data key directly.
    pub fn unlock(&self, storage_name: &str, password: Option<&str>) -> ConfigResult<Vec<u8>> {
        let stored = self
            .store
            .get(storage_name, ENCRYPTION_KEY_USERNAME)?
            .ok_or(ConfigError::NotFound)?;

        match password {
            None => Ok(stored),
            Some(pw) => unwrap_with_password(&stored, pw, &wrap_salt(storage_name)),
        }
    }

    /// Write a signed JSON export document containing the storage's data
    /// key. `password_protected` must match whether `create_key` wrapped
    /// the key at creation time — the stored bytes are carried through
    /// as-is rather than wrapped again here.
    pub fn export(
        &self,
        storage_name: &str,
        path: &Path,
        password_protected: bool,
    ) -> ConfigResult<()> {
        let stored = self
            .store
            .get(storage_name, ENCRYPTION_KEY_USERNAME)?
            .ok_or(ConfigError::NotFound)?;

        let salt_b64 = password_protected.then(|| b64.encode(wrap_salt(storage_name)));

        let mut doc = ExportDocument {
            schema_version: EXPORT_SCHEMA_VERSION,
            storage_name: storage_name.to_string(),
            password_protected,
            salt_b64,
            key_b64: b64.encode(stored),
            signature_b64: String::new(),
        };
        doc.signature_b64 = sign_document(&doc)?;

        let json = serde_json::to_vec_pretty(&doc).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Read back a signed export document, verify its HMAC, and restore
    /// the data key into the secret store under `storage_name`.
    pub fn import(
        &self,
        storage_name: &str,
        path: &Path,
        password: Option<&str>,
        overwrite: bool,
    ) -> ConfigResult<()> {
        if !overwrite && self.store.get(storage_name, ENCRYPTION_KEY_USERNAME)?.is_some() {
            return Err(ConfigError::AlreadyExists);
        }

        let bytes = std::fs::read(path).map_err(|_| ConfigError::NotFound)?;
        let doc: ExportDocument =
            serde_json::from_slice(&bytes).map_err(|_| ConfigError::CorruptExport)?;

        let expected_sig = sign_document(&doc)?;
        if expected_sig != doc.signature_b64 {
            return Err(ConfigError::CorruptExport);
        }

        let raw_key = b64
            .decode(&doc.key_b64)
            .map_err(|_| ConfigError::CorruptExport)?;

        if doc.password_protected {
            // Validate the password against the wrapped key before
            // accepting the import, but store the wrapped bytes as-is so
            // `unlock` with the same password continues to work.
            let pw = password.ok_or(ConfigError::BadPassword)?;
            let salt_b64 = doc.salt_b64.as_ref().ok_or(ConfigError::CorruptExport)?;
            let salt = b64.decode(salt_b64).map_err(|_| ConfigError::CorruptExport)?;
            unwrap_with_password(&raw_key, pw, &salt)?;
        }

        self.store
            .set(storage_name, ENCRYPTION_KEY_USERNAME, &raw_key)?;
        Ok(())
    }
}

fn sign_document(doc: &ExportDocument) -> ConfigResult<String> {
    let mut unsigned = ExportDocument {
        schema_version: doc.schema_version,
        storage_name: doc.storage_name.clone(),
        password_protected: doc.password_protected,
        salt_b64: doc.salt_b64.clone(),
        key_b64: doc.key_b64.clone(),
        signature_b64: String::new(),
    };
    unsigned.signature_b64.clear();
    let canonical =
        serde_json::to_vec(&unsigned).map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(HMAC_KEY)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    mac.update(&canonical);
    Ok(b64.encode(mac.finalize().into_bytes()))
}

/// Deterministic per-storage salt for the password wrap key. Not a secret —
/// it only needs to differ across storages, not be unpredictable — and
/// deriving it from `storage_name` keeps `unlock()` (which has no separate
/// salt parameter) symmetric with `export`/`import`.
fn wrap_salt(storage_name: &str) -> [u8; 16] {
    let digest = crate::digest::sha256(storage_name.as_bytes());
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

fn wrap_with_password(key: &[u8], password: &str, salt: &[u8]) -> ConfigResult<Vec<u8>> {
    let wrap_key = CryptoEnvelope::derive_key_from_password(password, salt)
        .map_err(|_| ConfigError::BadPassword)?;
    let cipher =
        Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| ConfigError::Invalid("bad wrap key".into()))?;
    let mut nonce_bytes = [0u8; 12];
    AeadOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: key,
                aad: &[],
            },
        )
        .map_err(|_| ConfigError::Invalid("key wrap failed".into()))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn unwrap_with_password(wrapped: &[u8], password: &str, salt: &[u8]) -> ConfigResult<Vec<u8>> {
    if wrapped.len() < 12 {
        return Err(ConfigError::CorruptExport);
    }
    let wrap_key = CryptoEnvelope::derive_key_from_password(password, salt)
        .map_err(|_| ConfigError::BadPassword)?;
    let cipher =
        Aes256Gcm::new_from_slice(&wrap_key).map_err(|_| ConfigError::Invalid("bad wrap key".into()))?;
    let nonce = Nonce::from_slice(&wrapped[..12]);
    let ciphertext = &wrapped[12..];
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| ConfigError::BadPassword)
}
