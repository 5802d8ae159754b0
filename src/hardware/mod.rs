//! Hardware wallet abstraction
//!
//! Vendor drivers implement [`HardwareWalletDriver`]. The shared session
//! lifecycle (state machine, per-device serialization, idle watcher) lives
//! in [`ManagedDevice`], and [`HardwareWalletManager`] holds at most one
//! active session and gates signing on the runtime and integrity checks.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> SigningInProgress -> Connected
//!       ^              |            |
//!       +--------------+------------+  (disconnect, idle timeout, transport loss)
//! ```

pub mod emulator;
pub mod manager;
pub mod path;
pub mod session;

pub use emulator::{EmulatorDriver, EmulatorFault};
pub use manager::{DegradeReason, GateDecision, HardwareWalletManager};
pub use path::{DerivationPath, HARDENED_BIT};
pub use session::{ManagedDevice, SessionSettings};

use crate::coin::CoinType;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported device vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VendorType {
    Ledger,
    Trezor,
    KeepKey,
    /// In-process software device
    Emulator,
}

impl VendorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorType::Ledger => "ledger",
            VendorType::Trezor => "trezor",
            VendorType::KeepKey => "keepkey",
            VendorType::Emulator => "emulator",
        }
    }
}

impl fmt::Display for VendorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connected device reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor: VendorType,
    pub model: String,
    pub firmware_version: String,
    pub serial: Option<String>,
}

/// Session state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    SigningInProgress,
}

/// Capability set every vendor driver provides.
///
/// Drivers only speak their transport. State tracking, serialization and
/// idle handling are layered on top by [`ManagedDevice`], so a driver
/// method may assume it is never called concurrently with another one on
/// the same session.
#[async_trait]
pub trait HardwareWalletDriver: Send + Sync {
    fn vendor(&self) -> VendorType;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Also used as the liveness probe for a connected session.
    async fn get_device_info(&self) -> Result<DeviceInfo>;

    async fn get_address(&self, coin: CoinType, path: &DerivationPath) -> Result<String>;

    /// Sign `unsigned_tx` for `coin`; the device applies the coin's digest
    /// rule itself.
    async fn sign_transaction(
        &self,
        coin: CoinType,
        path: &DerivationPath,
        unsigned_tx: &[u8],
    ) -> Result<Vec<u8>>;
}
