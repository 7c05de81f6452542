//! Crypto envelope: AES-256-GCM sealing of a whole-file plaintext buffer
//! into the on-disk/on-wire object format described in spec §4.2.
//!
//! ```text
//! HEADER(8B) || IV(12B) || CIPHERTEXT(+ 16B AEAD tag)
//! HEADER := magic(4B) "ATBU" || version(1B) || flags(1B) || reserved(2B)
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2,
};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};

const MAGIC: [u8; 4] = *b"ATBU";
const VERSION: u8 = 1;
const FLAG_PERSISTED_IV: u8 = 0b0000_0001;
const HEADER_LEN: usize = 8;
const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// AEAD sealer/opener bound to one 256-bit key. The plaintext SHA-256 is
/// always bound in as associated data so a flipped ciphertext bit, a wrong
/// key, or a tampered plaintext digest are all detected as the same
/// `AuthFailure`.
pub struct CryptoEnvelope {
    key: [u8; KEY_LEN],
}

impl CryptoEnvelope {
    /// Build an envelope from an existing 256-bit key.
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(key);
        Ok(Self { key: buf })
    }

    /// Generate a random 256-bit key.
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Derive a key-wrapping key from a password via Argon2, matching the
    /// teacher's derivation and extending with SHA-256 when the raw Argon2
    /// hash is shorter than the target key size.
    pub fn derive_key_from_password(password: &str, salt: &[u8]) -> CryptoResult<[u8; KEY_LEN]> {
        let salt_string = SaltString::encode_b64(salt)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt_string)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let raw = hash
            .hash
            .ok_or_else(|| CryptoError::KeyDerivation("argon2 produced no hash".into()))?;
        let bytes = raw.as_bytes();
        let mut key = [0u8; KEY_LEN];
        if bytes.len() >= KEY_LEN {
            key.copy_from_slice(&bytes[..KEY_LEN]);
        } else {
            let extended = crate::digest::sha256(bytes);
            key.copy_from_slice(&extended);
        }
        Ok(key)
    }

    /// Seal `plaintext`, binding `plaintext_digest` as AEAD associated
    /// data, and return the full `HEADER || IV || CIPHERTEXT` envelope.
    pub fn seal(&self, plaintext: &[u8], plaintext_digest: &[u8; 32]) -> CryptoResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut iv_bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: plaintext_digest,
                },
            )
            .map_err(|_| CryptoError::AuthFailure)?;

        let mut out = Vec::with_capacity(HEADER_LEN + IV_LEN + ciphertext.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(FLAG_PERSISTED_IV);
        out.extend_from_slice(&[0u8, 0u8]); // reserved
        out.extend_from_slice(&iv_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed envelope, returning the plaintext and the digest that
    /// was bound in as AAD (the caller compares it against the expected
    /// `FileRecord` digest rather than trusting ciphertext alone).
    pub fn open(&self, sealed: &[u8], plaintext_digest: &[u8; 32]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < HEADER_LEN + IV_LEN {
            return Err(CryptoError::Truncated);
        }
        if sealed[0..4] != MAGIC {
            return Err(CryptoError::BadMagic);
        }
        let version = sealed[4];
        if version != VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let iv = &sealed[HEADER_LEN..HEADER_LEN + IV_LEN];
        let ciphertext = &sealed[HEADER_LEN + IV_LEN..];

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let nonce = Nonce::from_slice(iv);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: plaintext_digest,
                },
            )
            .map_err(|_| CryptoError::AuthFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256;

    #[test]
    fn roundtrip_succeeds_with_matching_digest() {
        let key = CryptoEnvelope::generate_key();
        let envelope = CryptoEnvelope::new(&key).unwrap();
        let plaintext = b"hello, backup".to_vec();
        let digest = sha256(&plaintext);

        let sealed = envelope.seal(&plaintext, &digest).unwrap();
        let opened = envelope.open(&sealed, &digest).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn flipped_ciphertext_bit_fails_authentication() {
        let key = CryptoEnvelope::generate_key();
        let envelope = CryptoEnvelope::new(&key).unwrap();
        let plaintext = b"hello, backup".to_vec();
        let digest = sha256(&plaintext);

        let mut sealed = envelope.seal(&plaintext, &digest).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = envelope.open(&sealed, &digest).unwrap_err();
        assert!(matches!(err, CryptoError::AuthFailure));
    }

    #[test]
    fn wrong_digest_as_aad_fails_authentication() {
        let key = CryptoEnvelope::generate_key();
        let envelope = CryptoEnvelope::new(&key).unwrap();
        let plaintext = b"hello, backup".to_vec();
        let digest = sha256(&plaintext);
        let wrong_digest = sha256(b"other content");

        let sealed = envelope.seal(&plaintext, &digest).unwrap();
        let err = envelope.open(&sealed, &wrong_digest).unwrap_err();
        assert!(matches!(err, CryptoError::AuthFailure));
    }

    #[test]
    fn bad_magic_is_rejected_before_decryption() {
        let key = CryptoEnvelope::generate_key();
        let envelope = CryptoEnvelope::new(&key).unwrap();
        let mut sealed = envelope.seal(b"x", &sha256(b"x")).unwrap();
        sealed[0] = b'Z';
        assert!(matches!(
            envelope.open(&sealed, &sha256(b"x")).unwrap_err(),
            CryptoError::BadMagic
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let key = CryptoEnvelope::generate_key();
        let envelope = CryptoEnvelope::new(&key).unwrap();
        let mut sealed = envelope.seal(b"x", &sha256(b"x")).unwrap();
        sealed[4] = 99;
        assert!(matches!(
            envelope.open(&sealed, &sha256(b"x")).unwrap_err(),
            CryptoError::UnsupportedVersion(99)
        ));
    }
}
