//! Cryptographic core
//!
//! - `kdf`: PBKDF2 derivation, HMAC key combination, password hashing
//! - `layered`: three-layer AES-CBC protection of key material
//! - `secp256k1` / `ed25519`: signing primitives for the software path and
//!   the emulator device

pub mod ed25519;
pub mod kdf;
pub mod layered;
pub mod secp256k1;

pub use kdf::{
    combine, derive_key, KdfParams, PasswordHasher, BLOCK_LEN, IV_LEN, KEY_LEN, SALT_LEN,
};
pub use layered::{host_fingerprint, EncryptedBlob, LayeredCipher, ProtectionContext, SessionScope};
