//! Content-hash integrity verification
//!
//! Keeps a registry of `component id -> SHA-256` recorded the first time a
//! component is seen, and re-hashes on every verification. Reads run in
//! parallel; the write lock is only taken to register a new component.

use crate::config::IntegrityConfig;
use crate::errors::{CustodyError, Result};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Width of the time bucket folded into the runtime integrity hash
const HOUR_SECS: i64 = 3600;

/// A tracked piece of the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub id: String,
    /// Binary content to hash
    pub path: Option<PathBuf>,
    /// Fallback identity when the binary content is unavailable
    pub public_key_fingerprint: Option<String>,
}

impl Component {
    pub fn file(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: Some(path.into()),
            public_key_fingerprint: None,
        }
    }

    pub fn identity(id: impl Into<String>, public_key_fingerprint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            public_key_fingerprint: Some(public_key_fingerprint.into()),
        }
    }

    pub fn with_fingerprint(mut self, public_key_fingerprint: impl Into<String>) -> Self {
        self.public_key_fingerprint = Some(public_key_fingerprint.into());
        self
    }

    /// SHA-256 of the binary content, or of `id || fingerprint` when the
    /// content cannot be read.
    fn compute_hash(&self) -> Result<[u8; 32]> {
        if let Some(path) = &self.path {
            match fs::read(path) {
                Ok(content) => return Ok(Sha256::digest(&content).into()),
                Err(e) => debug!("Component {} content unavailable: {}", self.id, e),
            }
        }

        match &self.public_key_fingerprint {
            Some(fingerprint) => {
                let mut hasher = Sha256::new();
                hasher.update(self.id.as_bytes());
                hasher.update(fingerprint.as_bytes());
                Ok(hasher.finalize().into())
            }
            None => Err(CustodyError::Integrity(format!(
                "component {} has no hashable content",
                self.id
            ))),
        }
    }
}

/// Registry of expected component hashes
pub struct IntegrityVerifier {
    records: RwLock<BTreeMap<String, [u8; 32]>>,
    required: Vec<Component>,
}

impl IntegrityVerifier {
    pub fn new(required: Vec<Component>) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            required,
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Result<Self> {
        let mut required: Vec<Component> = config
            .components
            .iter()
            .map(|c| Component {
                id: c.id.clone(),
                path: c.path.clone(),
                public_key_fingerprint: c.public_key_fingerprint.clone(),
            })
            .collect();

        if config.include_self {
            let exe = std::env::current_exe()?;
            required.push(Component::file("self", exe));
        }

        Ok(Self::new(required))
    }

    pub fn required(&self) -> &[Component] {
        &self.required
    }

    async fn hash_off_thread(component: &Component) -> Result<[u8; 32]> {
        let component = component.clone();
        tokio::task::spawn_blocking(move || component.compute_hash()).await?
    }

    /// Hash and record every component, replacing earlier records.
    pub async fn initialize(&self, components: &[Component]) -> Result<()> {
        let hashes = join_all(components.iter().map(Self::hash_off_thread)).await;

        let mut records = self.records.write().await;
        for (component, hash) in components.iter().zip(hashes) {
            records.insert(component.id.clone(), hash?);
        }
        info!("Integrity baseline recorded for {} components", components.len());
        Ok(())
    }

    /// Register `component` if unseen, then compare its current hash with
    /// the recorded one.
    pub async fn verify_component(&self, component: &Component) -> bool {
        let current = match Self::hash_off_thread(component).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Could not hash component {}: {}", component.id, e);
                return false;
            }
        };

        let known = self.records.read().await.get(&component.id).copied();
        let expected = match known {
            Some(expected) => expected,
            None => {
                let mut records = self.records.write().await;
                // another task may have registered it between the two locks
                let expected = *records.entry(component.id.clone()).or_insert(current);
                debug!("Registered integrity baseline for {}", component.id);
                expected
            }
        };

        let matches: bool = expected.ct_eq(&current).into();
        if !matches {
            error!("Integrity mismatch for component {}", component.id);
        }
        matches
    }

    /// Every required component verifies.
    pub async fn verify_application(&self) -> bool {
        let results = join_all(self.required.iter().map(|c| self.verify_component(c))).await;
        results.into_iter().all(|ok| ok)
    }

    /// SHA-256 over all recorded hashes, the process id and the current
    /// hour. Changes every hour so a captured value cannot be replayed.
    pub async fn runtime_integrity_hash(&self) -> [u8; 32] {
        self.runtime_integrity_hash_at(chrono::Utc::now().timestamp()).await
    }

    async fn runtime_integrity_hash_at(&self, timestamp: i64) -> [u8; 32] {
        let records = self.records.read().await;
        let mut hasher = Sha256::new();
        for hash in records.values() {
            hasher.update(hash);
        }
        hasher.update(std::process::id().to_le_bytes());
        let bucket = timestamp.div_euclid(HOUR_SECS);
        hasher.update(bucket.to_le_bytes());
        hasher.finalize().into()
    }

    pub async fn recorded(&self) -> usize {
        self.records.read().await.len()
    }
}

/// Gate consulted before hardware signing
#[async_trait::async_trait]
pub trait ApplicationIntegrity: Send + Sync {
    async fn verify_application(&self) -> bool;
}

#[async_trait::async_trait]
impl ApplicationIntegrity for IntegrityVerifier {
    async fn verify_application(&self) -> bool {
        IntegrityVerifier::verify_application(self).await
    }
}
