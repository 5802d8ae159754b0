//! Ephemeral private-key cache
//!
//! Holds decrypted keys for a bounded idle time. A container that has not
//! been touched for the TTL is never handed out again; it is wiped and
//! dropped either by the accessor that finds it stale or by the periodic
//! sweeper. Accessors and the sweeper share one `RwLock`, so a reader can
//! never observe a container in the middle of being wiped.

use crate::crypto::LayeredCipher;
use crate::errors::{CustodyError, Result};
use crate::security::SecureBuffer;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Default idle lifetime of a cached key
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One decrypted key and its last access time
struct PrivateKeyContainer {
    key: SecureBuffer,
    last_access: Mutex<Instant>,
}

impl PrivateKeyContainer {
    fn new(key: SecureBuffer) -> Self {
        Self {
            key,
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(*self.last_access.lock()) >= ttl
    }

    /// Refresh the access time and hand out an unlocked copy.
    fn touch(&self) -> SecureBuffer {
        *self.last_access.lock() = Instant::now();
        SecureBuffer::from_slice(self.key.expose())
    }
}

/// TTL-bounded store of decrypted private keys, keyed by wallet id
pub struct KeyCache {
    cipher: Arc<LayeredCipher>,
    entries: RwLock<HashMap<String, PrivateKeyContainer>>,
    ttl: Duration,
    lock_memory: bool,
}

impl KeyCache {
    pub fn new(cipher: Arc<LayeredCipher>, ttl: Duration) -> Self {
        Self {
            cipher,
            entries: RwLock::new(HashMap::new()),
            ttl,
            lock_memory: false,
        }
    }

    /// Lock the pages of every cached key in memory.
    pub fn with_memory_locking(mut self, enabled: bool) -> Self {
        self.lock_memory = enabled;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the key for `wallet_id`, decrypting `encrypted_key` only when
    /// there is no live entry.
    ///
    /// A failed decrypt caches nothing and is reported as
    /// [`CustodyError::Authentication`].
    pub async fn load(
        &self,
        wallet_id: &str,
        encrypted_key: &str,
        password: &SecretString,
    ) -> Result<SecureBuffer> {
        if wallet_id.is_empty() {
            return Err(CustodyError::validation("wallet id must not be empty"));
        }
        if let Some(key) = self.get(wallet_id).await {
            return Ok(key);
        }

        let cipher = Arc::clone(&self.cipher);
        let encrypted = encrypted_key.to_string();
        let password = password.clone();
        let opened = tokio::task::spawn_blocking(move || {
            cipher.open_private_key(&encrypted, &password)
        })
        .await?;

        let key = match opened {
            Ok(key) => key,
            Err(_) => {
                debug!("Key for wallet {} did not decrypt", wallet_id);
                return Err(CustodyError::Authentication);
            }
        };
        let key = if self.lock_memory {
            SecureBuffer::locked(key.expose().to_vec())
        } else {
            key
        };

        let mut entries = self.entries.write().await;
        let now = Instant::now();
        // A concurrent load for the same wallet may have won the race.
        if let Some(existing) = entries.get(wallet_id) {
            if !existing.is_expired(now, self.ttl) {
                return Ok(existing.touch());
            }
        }

        let container = PrivateKeyContainer::new(key);
        let copy = container.touch();
        entries.insert(wallet_id.to_string(), container);
        debug!("Cached key for wallet {}", wallet_id);
        Ok(copy)
    }

    /// The cached key, if present and touched within the TTL. Refreshes the
    /// access time on a hit.
    pub async fn get(&self, wallet_id: &str) -> Option<SecureBuffer> {
        {
            let entries = self.entries.read().await;
            let container = entries.get(wallet_id)?;
            if !container.is_expired(Instant::now(), self.ttl) {
                return Some(container.touch());
            }
        }

        // Stale: evict under the exclusive lock, re-checking since another
        // task may have refreshed or replaced it in between.
        let mut entries = self.entries.write().await;
        let container = entries.get(wallet_id)?;
        if container.is_expired(Instant::now(), self.ttl) {
            entries.remove(wallet_id);
            debug!("Evicted expired key for wallet {}", wallet_id);
            None
        } else {
            Some(container.touch())
        }
    }

    /// Wipe and remove one wallet's key. Returns whether it was present.
    pub async fn clear(&self, wallet_id: &str) -> bool {
        let removed = self.entries.write().await.remove(wallet_id);
        removed.is_some()
    }

    /// Wipe and remove every cached key.
    pub async fn clear_all(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        if count > 0 {
            info!("Cleared {} cached keys", count);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Evict every container past the TTL. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, container| !container.is_expired(now, self.ttl));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Sweep evicted {} expired keys", evicted);
        }
        evicted
    }

    /// Start the periodic sweeper. The returned handle owns the task.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let cache = Arc::clone(&cache);
                        // Run each pass as its own task so a panic in one
                        // pass does not end the schedule.
                        if let Err(e) = tokio::spawn(async move { cache.sweep_expired().await }).await {
                            error!("Key cache sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("Key cache sweeper stopped");
        });

        info!("Key cache sweeper started (every {:?})", period);
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Owned handle to the sweeper task
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Key cache sweeper ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;

    const KEY_HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn cipher() -> Arc<LayeredCipher> {
        Arc::new(LayeredCipher::new(
            vec![0x11; 32],
            KdfParams {
                layer_iterations: 4,
                password_iterations: 8,
            },
            "cache-test-device",
        ))
    }

    fn password(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    async fn loaded_cache() -> KeyCache {
        let cipher = cipher();
        let encrypted = cipher.encrypt_private_key(KEY_HEX, &password("pw")).unwrap();
        let cache = KeyCache::new(cipher, DEFAULT_TTL);
        let key = cache.load("w1", &encrypted, &password("pw")).await.unwrap();
        assert_eq!(hex::encode(key.expose()), KEY_HEX);
        cache
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = loaded_cache().await;

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        assert!(cache.get("w1").await.is_some());

        // Untouched for six minutes after the last access
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert!(cache.get("w1").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_at_six_minutes_after_load() {
        let cache = loaded_cache().await;
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert!(cache.get("w1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_ttl() {
        let cache = loaded_cache().await;

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(4 * 60)).await;
            let key = cache.get("w1").await.unwrap();
            assert_eq!(hex::encode(key.expose()), KEY_HEX);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_caches_nothing() {
        let cipher = cipher();
        let encrypted = cipher.encrypt_private_key(KEY_HEX, &password("pw")).unwrap();
        let cache = KeyCache::new(cipher, DEFAULT_TTL);

        let err = cache.load("w1", &encrypted, &password("bad")).await.unwrap_err();
        assert!(matches!(err, CustodyError::Authentication));
        assert!(cache.is_empty().await);
        assert!(cache.get("w1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_reuses_live_entry() {
        let cache = loaded_cache().await;
        // No decrypt happens on a hit, so an unrelated blob is never parsed
        let key = cache.load("w1", "not-a-blob", &password("pw")).await.unwrap();
        assert_eq!(hex::encode(key.expose()), KEY_HEX);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_clear_all() {
        let cipher = cipher();
        let encrypted = cipher.encrypt_private_key(KEY_HEX, &password("pw")).unwrap();
        let cache = KeyCache::new(cipher, DEFAULT_TTL);
        cache.load("a", &encrypted, &password("pw")).await.unwrap();
        cache.load("b", &encrypted, &password("pw")).await.unwrap();

        assert!(cache.clear("a").await);
        assert!(!cache.clear("a").await);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());

        assert_eq!(cache.clear_all().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let cache = loaded_cache().await;
        assert_eq!(cache.sweep_expired().await, 0);

        tokio::time::advance(DEFAULT_TTL).await;
        assert_eq!(cache.sweep_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_in_background() {
        let cache = Arc::new(loaded_cache().await);
        let sweeper = cache.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);

        // Paused clock auto-advances through the sweeper's ticks
        tokio::time::sleep(Duration::from_secs(7 * 60)).await;
        assert_eq!(cache.len().await, 0);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_wallet_id_rejected() {
        let cache = KeyCache::new(cipher(), DEFAULT_TTL);
        assert!(matches!(
            cache.load("", "blob", &password("pw")).await,
            Err(CustodyError::Validation(_))
        ));
    }
}
