//! Configuration management for keyguard
//!
//! Supports loading configuration from:
//! - Built-in defaults
//! - Config file (keyguard.toml or /etc/keyguard/config)
//! - Environment variables (KEYGUARD__*)

use crate::errors::{CustodyError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Encryption core configuration
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Ephemeral key cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Hardware wallet configuration
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Runtime security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Integrity verification configuration
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Layered encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Application salt mixed into every layer key (hex, 32 bytes)
    pub app_salt: String,

    /// PBKDF2 iterations for the device and session layers
    pub layer_iterations: u32,

    /// PBKDF2 iterations for password-derived keys and password hashes
    pub password_iterations: u32,

    /// Device fingerprint override. When unset it is read from the host.
    pub device_fingerprint: Option<String>,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            app_salt: "6b657967756172642d6170706c69636174696f6e2d73616c742d76312d303030"
                .to_string(),
            layer_iterations: 10_000,
            password_iterations: 600_000,
            device_fingerprint: None,
        }
    }
}

impl CryptoConfig {
    pub fn app_salt_bytes(&self) -> Result<Vec<u8>> {
        let salt = hex::decode(&self.app_salt)?;
        if salt.len() != crate::crypto::SALT_LEN {
            return Err(CustodyError::Config(format!(
                "app_salt must be {} bytes, got {}",
                crate::crypto::SALT_LEN,
                salt.len()
            )));
        }
        Ok(salt)
    }
}

/// Key cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Idle time after which a cached key is evicted
    pub ttl_secs: u64,

    /// Background sweep period
    pub sweep_interval_secs: u64,

    /// Try to mlock cached key material
    pub lock_memory: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
            lock_memory: true,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Hardware wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Idle time after which a device disconnects itself
    pub idle_timeout_secs: u64,

    /// How often a connected device checks its idle timer
    pub liveness_interval_secs: u64,

    /// Lower bound of the randomized delay around device signing
    pub jitter_min_ms: u64,

    /// Upper bound of the randomized delay around device signing
    pub jitter_max_ms: u64,

    /// Register the software emulator as a vendor
    pub enable_emulator: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            liveness_interval_secs: 30,
            jitter_min_ms: 10,
            jitter_max_ms: 50,
            enable_emulator: false,
        }
    }
}

impl HardwareConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn jitter(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.jitter_min_ms),
            Duration::from_millis(self.jitter_max_ms),
        )
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Disable core dumps at startup
    pub disable_core_dumps: bool,

    /// Substrings of DMI vendor/model strings that indicate a VM
    pub vm_indicators: Vec<String>,

    /// Process names of known analysis tools
    pub analysis_tools: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            disable_core_dumps: true,
            vm_indicators: [
                "vmware",
                "virtualbox",
                "qemu",
                "kvm",
                "xen",
                "hyper-v",
                "parallels",
                "bochs",
                "innotek",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            analysis_tools: [
                "gdb",
                "lldb",
                "strace",
                "ltrace",
                "frida-server",
                "frida",
                "radare2",
                "r2",
                "ida64",
                "x64dbg",
                "wireshark",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// A component whose content is tracked by the integrity verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Stable component identifier
    pub id: String,

    /// Binary content on disk
    pub path: Option<PathBuf>,

    /// Hex fingerprint of the component's signing key, used when no
    /// binary content is available
    pub public_key_fingerprint: Option<String>,
}

/// Integrity verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Track the running executable as a required component
    pub include_self: bool,

    /// Additional required components
    pub components: Vec<ComponentConfig>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            include_self: true,
            components: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| CustodyError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            builder = builder
                .add_source(config::File::with_name("keyguard").required(false))
                .add_source(config::File::with_name("/etc/keyguard/config").required(false));
        }

        // KEYGUARD__CACHE__TTL_SECS, KEYGUARD__HARDWARE__ENABLE_EMULATOR, ...
        builder = builder.add_source(
            config::Environment::with_prefix("KEYGUARD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| CustodyError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.crypto.app_salt_bytes()?;

        if self.crypto.layer_iterations == 0 || self.crypto.password_iterations == 0 {
            return Err(CustodyError::Config(
                "PBKDF2 iteration counts must be non-zero".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(CustodyError::Config(
                "cache ttl and sweep interval must be non-zero".to_string(),
            ));
        }

        if self.hardware.jitter_min_ms > self.hardware.jitter_max_ms {
            return Err(CustodyError::Config(
                "jitter_min_ms exceeds jitter_max_ms".to_string(),
            ));
        }

        if self.hardware.liveness_interval_secs == 0 {
            return Err(CustodyError::Config(
                "liveness interval must be non-zero".to_string(),
            ));
        }

        for component in &self.integrity.components {
            if component.path.is_none() && component.public_key_fingerprint.is_none() {
                return Err(CustodyError::Config(format!(
                    "integrity component {} has neither path nor public_key_fingerprint",
                    component.id
                )));
            }
        }

        if self.cache.ttl_secs < self.cache.sweep_interval_secs {
            info!(
                "Cache TTL ({}s) is shorter than the sweep interval ({}s); expired keys are still hidden from readers",
                self.cache.ttl_secs, self.cache.sweep_interval_secs
            );
        }

        Ok(())
    }
}
