//! Hardware wallet manager
//!
//! Owns the registered vendor drivers and the single active session.
//! Device signing is gated on the runtime monitor and the integrity
//! verifier; a closed gate yields a random signature-shaped value instead
//! of an error.

use super::{
    DerivationPath, DeviceInfo, HardwareWalletDriver, ManagedDevice, SessionSettings, VendorType,
};
use crate::coin::CoinType;
use crate::config::HardwareConfig;
use crate::errors::{CustodyError, Result};
use crate::security::{ApplicationIntegrity, RuntimeMonitor, SecureBuffer};
use futures::future::join_all;
use rand::{rngs::OsRng, Rng, RngCore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Upper bound on a single detection probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the signing gate closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeReason {
    InsecureRuntime,
    IntegrityFailure,
}

/// Outcome of the pre-signing checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Degrade(DegradeReason),
}

/// Random bytes shaped like a genuine signature for `coin`.
fn degraded_signature(coin: CoinType) -> Vec<u8> {
    let mut bytes = vec![0u8; coin.signature_len()];
    OsRng.fill_bytes(&mut bytes);
    if coin.signature_len() == 65 {
        // recovery id of a real recoverable signature
        bytes[64] &= 1;
    }
    bytes
}

pub struct HardwareWalletManager {
    drivers: Vec<Arc<dyn HardwareWalletDriver>>,
    active: Mutex<Option<Arc<ManagedDevice>>>,
    monitor: Arc<RuntimeMonitor>,
    integrity: Arc<dyn ApplicationIntegrity>,
    session: SessionSettings,
    jitter: (Duration, Duration),
}

impl HardwareWalletManager {
    pub fn new(
        monitor: Arc<RuntimeMonitor>,
        integrity: Arc<dyn ApplicationIntegrity>,
        config: &HardwareConfig,
    ) -> Self {
        Self {
            drivers: Vec::new(),
            active: Mutex::new(None),
            monitor,
            integrity,
            session: SessionSettings::from(config),
            jitter: config.jitter(),
        }
    }

    /// Register a vendor driver. A later driver for the same vendor
    /// replaces the earlier one.
    pub fn with_driver(mut self, driver: Arc<dyn HardwareWalletDriver>) -> Self {
        self.drivers.retain(|d| d.vendor() != driver.vendor());
        self.drivers.push(driver);
        self
    }

    pub fn vendors(&self) -> Vec<VendorType> {
        self.drivers.iter().map(|d| d.vendor()).collect()
    }

    fn driver(&self, vendor: VendorType) -> Option<Arc<dyn HardwareWalletDriver>> {
        self.drivers.iter().find(|d| d.vendor() == vendor).cloned()
    }

    async fn active_device(&self) -> Option<Arc<ManagedDevice>> {
        let slot = self.active.lock().await;
        slot.as_ref().filter(|device| device.is_connected()).cloned()
    }

    /// Vendor of the active session, if any.
    pub async fn active_vendor(&self) -> Option<VendorType> {
        self.active_device().await.map(|device| device.vendor())
    }

    pub async fn active_device_info(&self) -> Option<DeviceInfo> {
        self.active_device().await.and_then(|device| device.device_info())
    }

    /// Probe every registered vendor in parallel.
    ///
    /// The vendor of the active session is reported without probing, since
    /// a probe connects and disconnects. The session slot stays locked for
    /// the whole pass so no session can open under a running probe.
    pub async fn detect_connected(&self) -> HashSet<VendorType> {
        let slot = self.active.lock().await;
        let active = slot
            .as_ref()
            .filter(|device| device.is_connected())
            .map(|device| device.vendor());

        let probes = self
            .drivers
            .iter()
            .filter(|driver| Some(driver.vendor()) != active)
            .map(|driver| async move {
                let vendor = driver.vendor();
                // A timed-out connect may have opened the link before it
                // was dropped, so it is closed like a successful one.
                let (present, opened) =
                    match tokio::time::timeout(PROBE_TIMEOUT, driver.connect()).await {
                        Ok(Ok(())) => (true, true),
                        Ok(Err(_)) => (false, false),
                        Err(_) => {
                            debug!("Probe for {} timed out", vendor);
                            (false, true)
                        }
                    };
                if opened {
                    if let Err(e) = driver.disconnect().await {
                        debug!("Probe disconnect for {} failed: {}", vendor, e);
                    }
                }
                (vendor, present)
            });

        let mut found: HashSet<VendorType> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(vendor, present)| present.then_some(vendor))
            .collect();
        found.extend(active);
        drop(slot);

        debug!("Detected devices: {:?}", found);
        found
    }

    /// Open a session with `vendor`.
    ///
    /// Returns false, leaving any existing session untouched, when a
    /// session is already active, the vendor is unknown, or the device
    /// cannot be reached.
    pub async fn connect(&self, vendor: VendorType) -> bool {
        let mut slot = self.active.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.is_connected() {
                warn!(
                    "Connect to {} rejected: {} session already active",
                    vendor,
                    current.vendor()
                );
                return false;
            }
        }

        let Some(driver) = self.driver(vendor) else {
            warn!("No driver registered for {}", vendor);
            return false;
        };

        let device = Arc::new(ManagedDevice::new(driver, self.session));
        match device.connect().await {
            Ok(()) => {
                info!("Hardware wallet session opened: {}", vendor);
                *slot = Some(device);
                true
            }
            Err(e) => {
                warn!("Could not connect to {}: {}", vendor, e);
                false
            }
        }
    }

    /// End the active session, if any.
    pub async fn disconnect(&self) {
        let device = self.active.lock().await.take();
        if let Some(device) = device {
            device.disconnect().await;
        }
    }

    pub async fn get_address(&self, coin: CoinType, derivation_path: &str) -> Result<String> {
        let device = self
            .active_device()
            .await
            .ok_or_else(|| CustodyError::device("not connected"))?;
        let path: DerivationPath = derivation_path.parse()?;
        device.get_address(coin, &path).await
    }

    /// Runtime and integrity checks that precede every device signature.
    pub async fn gate(&self) -> GateDecision {
        let monitor = Arc::clone(&self.monitor);
        let secure = match tokio::task::spawn_blocking(move || monitor.assess()).await {
            Ok(status) => status.is_secure(),
            Err(e) => {
                error!("Runtime assessment did not complete: {}", e);
                false
            }
        };
        if !secure {
            return GateDecision::Degrade(DegradeReason::InsecureRuntime);
        }

        if !self.integrity.verify_application().await {
            return GateDecision::Degrade(DegradeReason::IntegrityFailure);
        }

        GateDecision::Proceed
    }

    async fn jitter(&self) {
        let (min, max) = self.jitter;
        if max.is_zero() {
            return;
        }
        let millis = OsRng.gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Sign with the active device.
    pub async fn sign_transaction(
        &self,
        coin: CoinType,
        derivation_path: &str,
        unsigned_tx: &[u8],
    ) -> Result<Vec<u8>> {
        self.sign_gated(coin, derivation_path, unsigned_tx)
            .await
            .map(|(signature, _)| signature)
    }

    /// Like [`sign_transaction`](Self::sign_transaction), also reporting
    /// which way the gate went, for audit logging.
    pub async fn sign_gated(
        &self,
        coin: CoinType,
        derivation_path: &str,
        unsigned_tx: &[u8],
    ) -> Result<(Vec<u8>, GateDecision)> {
        let device = self
            .active_device()
            .await
            .ok_or_else(|| CustodyError::device("not connected"))?;
        if unsigned_tx.is_empty() {
            return Err(CustodyError::validation("transaction must not be empty"));
        }
        let path: DerivationPath = derivation_path.parse()?;

        let decision = self.gate().await;
        self.jitter().await;
        if let GateDecision::Degrade(reason) = decision {
            warn!(?reason, "Signing gate closed");
            let signature = degraded_signature(coin);
            self.jitter().await;
            return Ok((signature, decision));
        }

        let mut transient = SecureBuffer::from_slice(unsigned_tx);
        let result = device.sign(coin, &path, transient.expose()).await;
        transient.wipe();
        self.jitter().await;

        let signature = result?;
        debug!("{} signature produced by {}", coin, device.vendor());
        Ok((signature, decision))
    }
}
