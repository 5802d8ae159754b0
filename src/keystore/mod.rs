//! Key storage
//!
//! Decrypted private keys live only in the TTL-bounded [`KeyCache`]; the
//! encrypted blobs themselves are owned by the caller's wallet repository.

pub mod cache;

pub use cache::{KeyCache, SweeperHandle, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
