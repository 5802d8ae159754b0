//! Key derivation, key combination and password hashing
//!
//! All derivation is PBKDF2-HMAC-SHA-256. Iteration counts are injected
//! through [`KdfParams`] rather than fixed, so tests and constrained
//! deployments can lower them without touching the wire format.

use crate::errors::{CustodyError, Result};
use crate::security::SecureBuffer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric key length (AES-256)
pub const KEY_LEN: usize = 32;

/// CBC initialization vector length
pub const IV_LEN: usize = 16;

/// Salt length for password hashes and the application salt
pub const SALT_LEN: usize = 32;

/// AES block length
pub const BLOCK_LEN: usize = 16;

/// Default PBKDF2 iterations for device and session layer keys
pub const LAYER_ITERATIONS: u32 = 10_000;

/// Default PBKDF2 iterations for password-derived keys and hashes
pub const PASSWORD_ITERATIONS: u32 = 600_000;

/// PBKDF2 work factors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub layer_iterations: u32,
    pub password_iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            layer_iterations: LAYER_ITERATIONS,
            password_iterations: PASSWORD_ITERATIONS,
        }
    }
}

impl From<&crate::config::CryptoConfig> for KdfParams {
    fn from(config: &crate::config::CryptoConfig) -> Self {
        Self {
            layer_iterations: config.layer_iterations,
            password_iterations: config.password_iterations,
        }
    }
}

/// PBKDF2-HMAC-SHA-256 of `secret` under `salt`, `out_len` bytes long.
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> SecureBuffer {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut out);
    SecureBuffer::new(out)
}

/// HMAC-SHA-256 keyed by `key_a` over `key_b`.
///
/// Not commutative: `combine(a, b) != combine(b, a)`. Decryption must pass
/// the arguments in the same order encryption did.
pub fn combine(key_a: &[u8], key_b: &[u8]) -> Result<SecureBuffer> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key_a)
        .map_err(|e| CustodyError::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(key_b);
    Ok(SecureBuffer::new(mac.finalize().into_bytes().to_vec()))
}

/// Salted PBKDF2 password hashing for credential verification.
///
/// Stored form is base64(`salt(32) || hash(32)`).
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    iterations: u32,
}

impl PasswordHasher {
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    pub fn hash_password(&self, password: &SecretString) -> Result<String> {
        if password.expose_secret().is_empty() {
            return Err(CustodyError::validation("password must not be empty"));
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let hash = derive_key(
            password.expose_secret().as_bytes(),
            &salt,
            self.iterations,
            KEY_LEN,
        );

        // capacity reserved up front so the joined buffer never reallocates
        let mut joined = Vec::with_capacity(SALT_LEN + KEY_LEN);
        joined.extend_from_slice(&salt);
        joined.extend_from_slice(hash.expose());
        let joined = SecureBuffer::new(joined);
        Ok(STANDARD.encode(joined.expose()))
    }

    /// Recompute with the stored salt and compare in constant time.
    ///
    /// Malformed stored values verify as `false`.
    pub fn verify_password_hash(&self, password: &SecretString, stored: &str) -> bool {
        let Ok(decoded) = STANDARD.decode(stored) else {
            return false;
        };
        let decoded = SecureBuffer::new(decoded);
        if decoded.len() != SALT_LEN + KEY_LEN {
            return false;
        }

        let (salt, expected) = decoded.expose().split_at(SALT_LEN);
        let actual = derive_key(
            password.expose_secret().as_bytes(),
            salt,
            self.iterations,
            KEY_LEN,
        );
        actual.expose().ct_eq(expected).into()
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(PASSWORD_ITERATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_rfc7914_vector() {
        // PBKDF2-HMAC-SHA256, P="passwd", S="salt", c=1, dkLen=64 (RFC 7914 §11)
        let key = derive_key(b"passwd", b"salt", 1, 64);
        assert_eq!(
            hex::encode(key.expose()),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc\
             49ca9cccf179b645991664b39d77ef317c71b845b1e30bd509112041d3a19783"
        );
    }

    #[test]
    fn test_derive_key_output_length() {
        let key = derive_key(b"secret", b"salt", 10, KEY_LEN);
        assert_eq!(key.len(), KEY_LEN);
    }

    #[test]
    fn test_combine_is_not_commutative() {
        let ab = combine(b"key-a", b"key-b").unwrap();
        let ba = combine(b"key-b", b"key-a").unwrap();
        assert_eq!(ab.len(), 32);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_combine_rfc4231_case_2() {
        let mac = combine(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac.expose()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hasher = PasswordHasher::new(64);
        let password = SecretString::new("correct horse".to_string());

        let stored = hasher.hash_password(&password).unwrap();
        let raw = STANDARD.decode(&stored).unwrap();
        assert_eq!(raw.len(), SALT_LEN + KEY_LEN);

        assert!(hasher.verify_password_hash(&password, &stored));
        assert!(!hasher.verify_password_hash(&SecretString::new("battery staple".to_string()), &stored));
    }

    #[test]
    fn test_password_hash_uses_fresh_salt() {
        let hasher = PasswordHasher::new(16);
        let password = SecretString::new("same password".to_string());
        let a = hasher.hash_password(&password).unwrap();
        let b = hasher.hash_password(&password).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_does_not_verify() {
        let hasher = PasswordHasher::new(16);
        let password = SecretString::new("pw".to_string());
        assert!(!hasher.verify_password_hash(&password, "not base64 !!"));
        assert!(!hasher.verify_password_hash(&password, &STANDARD.encode([0u8; 10])));
    }

    #[test]
    fn test_empty_password_rejected() {
        let hasher = PasswordHasher::new(16);
        let err = hasher.hash_password(&SecretString::new(String::new())).unwrap_err();
        assert!(matches!(err, CustodyError::Validation(_)));
    }
}
