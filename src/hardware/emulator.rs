//! In-process software device
//!
//! Behaves like a vendor driver without any transport: keys are derived
//! from a seed and the derivation path, and signatures are real. Faults
//! (user declined, broken transport, unplugged, slow responses) can be
//! injected for exercising the session lifecycle.
//!
//! The per-path key is `HMAC-SHA-256(seed, coin || path)`. This is not
//! BIP-32; addresses will not match a physical device with the same seed.

use super::{DerivationPath, DeviceInfo, HardwareWalletDriver, VendorType};
use crate::coin::CoinType;
use crate::crypto::ed25519::Ed25519KeyPair;
use crate::crypto::kdf::combine;
use crate::crypto::secp256k1::{self, Secp256k1KeyPair};
use crate::errors::{CustodyError, Result};
use crate::security::SecureBuffer;
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

/// Injectable failure for the next device operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorFault {
    /// The user rejects on the device; the link stays up
    UserDeclined,
    /// The link breaks; every call fails until the fault is cleared
    Transport,
}

#[derive(Debug, Default)]
struct EmulatorState {
    connected: bool,
    unplugged: bool,
    fault: Option<EmulatorFault>,
    connect_delay: Duration,
    info_delay: Duration,
    sign_delay: Duration,
}

/// Software hardware wallet
pub struct EmulatorDriver {
    vendor: VendorType,
    seed: Zeroizing<[u8; 32]>,
    state: Mutex<EmulatorState>,
}

impl EmulatorDriver {
    pub fn new(seed: [u8; 32]) -> Self {
        Self::with_vendor(VendorType::Emulator, seed)
    }

    /// Emulate a device that reports itself as `vendor`.
    pub fn with_vendor(vendor: VendorType, seed: [u8; 32]) -> Self {
        Self {
            vendor,
            seed: Zeroizing::new(seed),
            state: Mutex::new(EmulatorState::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn set_plugged(&self, plugged: bool) {
        let mut state = self.state.lock();
        state.unplugged = !plugged;
        if !plugged {
            state.connected = false;
        }
    }

    pub fn inject_fault(&self, fault: Option<EmulatorFault>) {
        self.state.lock().fault = fault;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_info_delay(&self, delay: Duration) {
        self.state.lock().info_delay = delay;
    }

    pub fn set_sign_delay(&self, delay: Duration) {
        self.state.lock().sign_delay = delay;
    }

    fn derive_secret(&self, coin: CoinType, path: &DerivationPath) -> Result<SecureBuffer> {
        let mut material = Vec::with_capacity(16 + path.len() * 4);
        material.extend_from_slice(coin.as_str().as_bytes());
        material.extend_from_slice(&path.to_bytes());
        combine(self.seed.as_slice(), &material)
    }

    /// Public key the device signs with for `coin` at `path`.
    ///
    /// SEC1 compressed for secp256k1 coins, raw 32 bytes for ed25519.
    pub fn public_key(&self, coin: CoinType, path: &DerivationPath) -> Result<Vec<u8>> {
        let secret = self.derive_secret(coin, path)?;
        coin.public_key(secret.expose())
    }

    /// Fails unless plugged in, connected and the link is healthy.
    fn check_link(&self) -> Result<()> {
        let state = self.state.lock();
        if state.unplugged {
            return Err(CustodyError::device("device unplugged"));
        }
        if !state.connected {
            return Err(CustodyError::device("not connected"));
        }
        if state.fault == Some(EmulatorFault::Transport) {
            return Err(CustodyError::device("transport error"));
        }
        Ok(())
    }

    fn check_user(&self) -> Result<()> {
        if self.state.lock().fault == Some(EmulatorFault::UserDeclined) {
            return Err(CustodyError::device("user declined on device"));
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareWalletDriver for EmulatorDriver {
    fn vendor(&self) -> VendorType {
        self.vendor
    }

    async fn connect(&self) -> Result<()> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.unplugged {
            return Err(CustodyError::device("no device found"));
        }
        state.connected = true;
        debug!("{} emulator connected", self.vendor);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn get_device_info(&self) -> Result<DeviceInfo> {
        let delay = self.state.lock().info_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_link()?;
        let fingerprint = Sha256::digest(self.seed.as_slice());
        Ok(DeviceInfo {
            vendor: self.vendor,
            model: "Software Emulator".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            serial: Some(hex::encode(&fingerprint[..4])),
        })
    }

    async fn get_address(&self, coin: CoinType, path: &DerivationPath) -> Result<String> {
        self.check_link()?;
        self.check_user()?;

        let secret = self.derive_secret(coin, path)?;
        let address = match coin {
            CoinType::Bitcoin => {
                hex::encode(Secp256k1KeyPair::from_bytes(secret.expose())?.public_key_compressed())
            }
            CoinType::Ethereum => secp256k1::checksum_address(
                &Secp256k1KeyPair::from_bytes(secret.expose())?.eth_address(),
            ),
            CoinType::Solana => Ed25519KeyPair::from_seed(secret.expose())?.public_key_base58(),
        };
        Ok(address)
    }

    async fn sign_transaction(
        &self,
        coin: CoinType,
        path: &DerivationPath,
        unsigned_tx: &[u8],
    ) -> Result<Vec<u8>> {
        self.check_link()?;

        let delay = self.state.lock().sign_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_user()?;

        let secret = self.derive_secret(coin, path)?;
        coin.sign_with_key(secret.expose(), unsigned_tx)
    }
}
