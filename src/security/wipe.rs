//! Secure erasure of sensitive buffers
//!
//! Every buffer that held key material, a password or a derived secret is
//! wiped in three passes (zeros, random bytes, zeros) before its memory is
//! handed back to the allocator. The zero passes go through `zeroize` so
//! the compiler cannot elide them.
//!
//! This is best-effort. It does not cover copies the compiler or allocator
//! made earlier (moves, reallocation), pages already written to swap, or
//! CPU-level side channels. Memory locking (see [`super::mlock`]) narrows
//! the swap window; nothing here closes it completely.

use crate::security::mlock::{lock_memory, unlock_memory};
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{compiler_fence, Ordering};
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Overwrite `buf` with zeros, then random bytes, then zeros again.
pub fn secure_wipe(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    buf.zeroize();
    rand::thread_rng().fill_bytes(buf);
    compiler_fence(Ordering::SeqCst);
    buf.zeroize();
}

/// Wipe a vector's full capacity and release it.
pub fn secure_wipe_vec(buf: &mut Vec<u8>) {
    secure_wipe(buf.as_mut_slice());
    // zeroize on Vec also clears the spare capacity, then truncates
    buf.zeroize();
    *buf = Vec::new();
}

/// Owned sensitive bytes, wiped on drop.
///
/// Optionally memory-locked so the pages are not swapped out while the
/// buffer is alive. Buffers sharing a page share its lock, which is held
/// until the last of them is wiped. The buffer never grows after construction, so there is
/// no reallocation leaving stale copies behind.
pub struct SecureBuffer {
    inner: Vec<u8>,
    locked: bool,
}

impl SecureBuffer {
    /// Take ownership of `data` without locking it.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: data,
            locked: false,
        }
    }

    /// Take ownership of `data` and try to lock its pages.
    ///
    /// Locking failure is logged and tolerated; the buffer is still wiped
    /// on drop.
    pub fn locked(data: Vec<u8>) -> Self {
        let locked = unsafe {
            match lock_memory(data.as_ptr(), data.len()) {
                Ok(()) => !data.is_empty(),
                Err(e) => {
                    warn!("Could not lock key buffer, continuing without: {}", e);
                    false
                }
            }
        };
        Self {
            inner: data,
            locked,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn expose_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// Wipe now instead of waiting for drop. The buffer is empty afterwards.
    pub fn wipe(&mut self) {
        secure_wipe(&mut self.inner);
        if self.locked {
            if let Err(e) = unsafe { unlock_memory(self.inner.as_ptr(), self.inner.len()) } {
                debug!("Could not unlock key buffer: {}", e);
            }
            self.locked = false;
        }
        secure_wipe_vec(&mut self.inner);
    }
}

impl Clone for SecureBuffer {
    fn clone(&self) -> Self {
        if self.locked {
            Self::locked(self.inner.clone())
        } else {
            Self::new(self.inner.clone())
        }
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.inner.len())
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.inner.len() == other.inner.len() && bool::from(self.inner.ct_eq(&other.inner))
    }
}

impl Eq for SecureBuffer {}
