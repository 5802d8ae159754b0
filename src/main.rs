//! keyguard - key custody daemon
//!
//! Loads configuration, hardens the process, checks the runtime and the
//! application's integrity, probes for hardware wallets and keeps the key
//! cache swept until shut down.
//!
//! # Usage
//!
//! ```bash
//! # Defaults plus ./keyguard.toml or /etc/keyguard/config if present
//! keyguard
//!
//! # Explicit config file
//! keyguard --config /etc/keyguard/config.toml
//!
//! # Environment overrides
//! KEYGUARD__CACHE__TTL_SECS=120 KEYGUARD__HARDWARE__ENABLE_EMULATOR=true keyguard
//!
//! # Print the effective configuration as JSON and exit
//! keyguard --print-config
//! ```

use keyguard::config::{Config, LoggingConfig};
use keyguard::crypto::{host_fingerprint, KdfParams, LayeredCipher};
use keyguard::errors::{CustodyError, Result};
use keyguard::hardware::{EmulatorDriver, HardwareWalletManager};
use keyguard::keystore::KeyCache;
use keyguard::security::{setup_memory_protection, IntegrityVerifier, RuntimeMonitor};
use rand::RngCore;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_arg();
    let config = Config::load(config_path.as_deref())?;

    if env::args().any(|arg| arg == "--print-config") {
        let rendered = serde_json::to_string_pretty(&config)
            .map_err(|e| CustodyError::Config(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    init_logging(&config.logging);
    info!("Starting keyguard v{}", VERSION);

    config.validate()?;
    info!("Configuration loaded");

    let protection = setup_memory_protection(config.security.disable_core_dumps);
    if !protection.mlock_available && config.cache.lock_memory {
        warn!("Memory locking unavailable; cached keys may be swapped");
    }

    // Encryption core
    let fingerprint = config
        .crypto
        .device_fingerprint
        .clone()
        .unwrap_or_else(host_fingerprint);
    let cipher = Arc::new(LayeredCipher::new(
        config.crypto.app_salt_bytes()?,
        KdfParams::from(&config.crypto),
        fingerprint,
    ));

    // Runtime and integrity checks
    let monitor = Arc::new(RuntimeMonitor::from_config(&config.security));
    if !monitor.is_runtime_secure() {
        warn!("Runtime environment flagged; device signing will be degraded");
    }

    let integrity = Arc::new(IntegrityVerifier::from_config(&config.integrity)?);
    integrity.initialize(integrity.required()).await?;
    info!(
        "Integrity baseline: {}",
        hex::encode(integrity.runtime_integrity_hash().await)
    );

    // Hardware wallets
    let mut manager = HardwareWalletManager::new(monitor, integrity, &config.hardware);
    if config.hardware.enable_emulator {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        manager = manager.with_driver(Arc::new(EmulatorDriver::new(seed)));
        info!("Software emulator registered");
    }
    let detected = manager.detect_connected().await;
    info!("Hardware wallets present: {:?}", detected);

    // Key cache
    let cache = Arc::new(
        KeyCache::new(cipher, config.cache.ttl()).with_memory_locking(config.cache.lock_memory),
    );
    let sweeper = cache.spawn_sweeper(config.cache.sweep_interval());

    info!("keyguard ready");
    shutdown_signal().await;

    sweeper.shutdown().await;
    manager.disconnect().await;
    cache.clear_all().await;

    info!("Shut down cleanly");
    Ok(())
}

/// `--config <path>` from the command line
fn config_path_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Initialize logging
fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
