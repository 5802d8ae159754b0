//! Session lifecycle shared by every vendor
//!
//! [`ManagedDevice`] wraps a driver with:
//! - the connection state machine
//! - a per-device async mutex so only one operation is in flight
//! - an idle watcher that disconnects after the idle timeout and drops the
//!   session when a liveness probe fails
//!
//! Transitions are made through a `StateGuard`, which restores the previous
//! resting state if the future driving the transition is dropped. A
//! cancelled connect therefore ends in `Disconnected` and a cancelled sign
//! in `Connected`, and a connect abandoned after the driver link opened
//! also closes that link.

use super::{DerivationPath, DeviceInfo, DeviceState, HardwareWalletDriver, VendorType};
use crate::coin::CoinType;
use crate::config::HardwareConfig;
use crate::errors::{CustodyError, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Idle and liveness timing for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub liveness_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            liveness_interval: Duration::from_secs(30),
        }
    }
}

impl From<&HardwareConfig> for SessionSettings {
    fn from(config: &HardwareConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            liveness_interval: config.liveness_interval(),
        }
    }
}

struct Shared {
    driver: Arc<dyn HardwareWalletDriver>,
    state: Mutex<DeviceState>,
    io: tokio::sync::Mutex<()>,
    last_activity: Mutex<Instant>,
    info: Mutex<Option<DeviceInfo>>,
    settings: SessionSettings,
}

impl Shared {
    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_activity.lock())
    }

    /// Close the session. The state is `Disconnected` before the driver is
    /// asked to tear down, so a failing or cancelled teardown cannot leave
    /// it anywhere else.
    async fn teardown(&self, reason: &str) {
        *self.state.lock() = DeviceState::Disconnected;
        self.info.lock().take();
        if let Err(e) = self.driver.disconnect().await {
            warn!("{} disconnect reported an error: {}", self.driver.vendor(), e);
        }
        info!(vendor = %self.driver.vendor(), reason, "Device session closed");
    }
}

/// Puts the state back to `restore` on drop unless committed.
///
/// Once [`opened`](Self::opened) has recorded a live driver link, an
/// uncommitted drop also closes that link on a spawned task. The task takes
/// the session IO lock and leaves the link alone if a newer connect has
/// already brought the session up.
struct StateGuard<'a> {
    state: &'a Mutex<DeviceState>,
    restore: DeviceState,
    armed: bool,
    transport: Option<Arc<Shared>>,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a Mutex<DeviceState>, next: DeviceState, restore: DeviceState) -> Self {
        *state.lock() = next;
        Self {
            state,
            restore,
            armed: true,
            transport: None,
        }
    }

    fn opened(&mut self, shared: &Arc<Shared>) {
        self.transport = Some(Arc::clone(shared));
    }

    fn commit(mut self, resting: DeviceState) {
        *self.state.lock() = resting;
        self.armed = false;
        self.transport = None;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        *self.state.lock() = self.restore;

        if let Some(shared) = self.transport.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _io = shared.io.lock().await;
                        if shared.state() != DeviceState::Disconnected {
                            return;
                        }
                        if let Err(e) = shared.driver.disconnect().await {
                            debug!("Closing abandoned {} link: {}", shared.driver.vendor(), e);
                        }
                    });
                }
                Err(_) => warn!(
                    "{} link left open: no runtime to close it on",
                    shared.driver.vendor()
                ),
            }
        }
    }
}

/// A driver plus its session lifecycle
pub struct ManagedDevice {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedDevice {
    pub fn new(driver: Arc<dyn HardwareWalletDriver>, settings: SessionSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                state: Mutex::new(DeviceState::Disconnected),
                io: tokio::sync::Mutex::new(()),
                last_activity: Mutex::new(Instant::now()),
                info: Mutex::new(None),
                settings,
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn vendor(&self) -> VendorType {
        self.shared.driver.vendor()
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            DeviceState::Connected | DeviceState::SigningInProgress
        )
    }

    /// Info captured at connect time
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.info.lock().clone()
    }

    pub async fn connect(&self) -> Result<()> {
        let _io = self.shared.io.lock().await;
        match self.shared.state() {
            DeviceState::Disconnected => {}
            DeviceState::Connected | DeviceState::SigningInProgress => return Ok(()),
            DeviceState::Connecting => {
                return Err(CustodyError::device("connect already in progress"))
            }
        }

        let mut guard = StateGuard::enter(
            &self.shared.state,
            DeviceState::Connecting,
            DeviceState::Disconnected,
        );

        self.shared.driver.connect().await?;
        // from here an abandoned connect must close the link
        guard.opened(&self.shared);

        let info = self.shared.driver.get_device_info().await?;

        info!(
            vendor = %info.vendor,
            model = %info.model,
            firmware = %info.firmware_version,
            "Device connected"
        );
        *self.shared.info.lock() = Some(info);
        self.shared.touch();
        guard.commit(DeviceState::Connected);

        self.spawn_watcher();
        Ok(())
    }

    /// Always ends in `Disconnected`.
    pub async fn disconnect(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        let _io = self.shared.io.lock().await;
        if self.shared.state() != DeviceState::Disconnected {
            self.shared.teardown("disconnect requested").await;
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.shared.state() == DeviceState::Connected {
            Ok(())
        } else {
            Err(CustodyError::device("not connected"))
        }
    }

    pub async fn get_address(&self, coin: CoinType, path: &DerivationPath) -> Result<String> {
        let _io = self.shared.io.lock().await;
        self.require_connected()?;

        let result = self.shared.driver.get_address(coin, path).await;
        self.shared.touch();
        if result.is_err() {
            self.check_transport().await;
        }
        result
    }

    pub async fn sign(
        &self,
        coin: CoinType,
        path: &DerivationPath,
        unsigned_tx: &[u8],
    ) -> Result<Vec<u8>> {
        let _io = self.shared.io.lock().await;
        self.require_connected()?;

        let guard = StateGuard::enter(
            &self.shared.state,
            DeviceState::SigningInProgress,
            DeviceState::Connected,
        );
        let result = self
            .shared
            .driver
            .sign_transaction(coin, path, unsigned_tx)
            .await;
        self.shared.touch();
        guard.commit(DeviceState::Connected);

        if result.is_err() {
            self.check_transport().await;
        }
        result
    }

    /// After a failed call, tell "device said no" apart from "device is
    /// gone". Only the latter ends the session.
    async fn check_transport(&self) {
        if self.shared.driver.get_device_info().await.is_err() {
            self.shared.teardown("transport lost").await;
            if let Some(watcher) = self.watcher.lock().take() {
                watcher.abort();
            }
        }
    }

    fn spawn_watcher(&self) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.shared.settings.liveness_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                match shared.state() {
                    DeviceState::Disconnected => break,
                    DeviceState::Connected => {}
                    DeviceState::Connecting | DeviceState::SigningInProgress => continue,
                }

                if shared.idle_for() >= shared.settings.idle_timeout {
                    let _io = shared.io.lock().await;
                    // activity may have happened while waiting for the lock
                    if shared.state() == DeviceState::Connected
                        && shared.idle_for() >= shared.settings.idle_timeout
                    {
                        shared.teardown("idle timeout").await;
                        break;
                    }
                    continue;
                }

                // Busy means alive; only probe an idle device.
                let Ok(_io) = shared.io.try_lock() else {
                    continue;
                };
                if let Err(e) = shared.driver.get_device_info().await {
                    debug!("Liveness probe failed: {}", e);
                    shared.teardown("liveness check failed").await;
                    break;
                }
            }
        });

        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for ManagedDevice {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}
