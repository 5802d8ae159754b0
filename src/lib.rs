//! keyguard - key custody and hardware-wallet signing
//!
//! - Three-layer AES-256-CBC protection of private keys under device,
//!   session and password keys
//! - A TTL-bounded cache of decrypted keys with a background sweeper
//! - Runtime environment checks and content-hash integrity verification
//! - A vendor-agnostic hardware wallet session manager that degrades to an
//!   unverifiable signature when the environment cannot be trusted
//!
//! # Security
//!
//! - Every buffer holding key material is wiped in several passes on drop
//! - Cached keys can be held in memory-locked pages
//! - Decrypt failures never carry detail; internal failures are obfuscated
//!   before they reach a caller

pub mod coin;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod hardware;
pub mod keystore;
pub mod security;
pub mod signer;

pub use coin::CoinType;
pub use config::Config;
pub use crypto::{LayeredCipher, PasswordHasher, ProtectionContext, SessionScope};
pub use errors::{CustodyError, Result};
pub use hardware::{
    DerivationPath, DeviceState, EmulatorDriver, HardwareWalletDriver, HardwareWalletManager,
    VendorType,
};
pub use keystore::KeyCache;
pub use security::{IntegrityVerifier, RuntimeMonitor};
pub use signer::{KeySource, SecureTransactionSigner, SignatureOrigin, SignatureOutcome, SigningRequest};
