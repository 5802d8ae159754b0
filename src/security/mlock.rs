//! Memory locking utilities
//!
//! Locks the pages that back key material so they are not written to swap,
//! and disables core dumps for the process. Where the platform or rlimits
//! refuse, callers carry on with a warning.
//!
//! `mlock` does not nest: one `munlock` unlocks a page no matter how many
//! buffers on it asked for the lock. Locks are therefore counted per page
//! and a page is only unlocked when its last holder lets go.

use crate::errors::{CustodyError, Result};
use nix::libc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Lock holders per page start address
static PAGE_LOCKS: Mutex<BTreeMap<usize, usize>> = parking_lot::const_mutex(BTreeMap::new());

/// Count one more holder for every page in the span.
fn retain_pages(counts: &mut BTreeMap<usize, usize>, start: usize, len: usize, page_size: usize) {
    for page in (start..start + len).step_by(page_size) {
        *counts.entry(page).or_insert(0) += 1;
    }
}

/// Drop one holder for every page in the span and return the pages that
/// have none left.
fn release_pages(
    counts: &mut BTreeMap<usize, usize>,
    start: usize,
    len: usize,
    page_size: usize,
) -> Vec<usize> {
    let mut freed = Vec::new();
    for page in (start..start + len).step_by(page_size) {
        match counts.get_mut(&page) {
            Some(holders) if *holders > 1 => *holders -= 1,
            Some(_) => {
                counts.remove(&page);
                freed.push(page);
            }
            None => {}
        }
    }
    freed
}

/// Check if we can lock memory (requires appropriate privileges or rlimits)
pub fn can_lock_memory() -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{getrlimit, Resource};

        match getrlimit(Resource::RLIMIT_MEMLOCK) {
            Ok((soft, _hard)) => soft > 0,
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Page-aligned span covering `[ptr, ptr + len)`.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn page_span(ptr: *const u8, len: usize) -> (usize, usize) {
    let page_size = page_size();
    let addr = ptr as usize;
    let aligned_addr = addr & !(page_size - 1);
    let offset = addr - aligned_addr;
    let aligned_len = (len + offset + page_size - 1) & !(page_size - 1);
    (aligned_addr, aligned_len)
}

/// Lock a memory region to prevent it from being swapped
///
/// # Safety
/// The memory region must be valid for `len` bytes
pub unsafe fn lock_memory(ptr: *const u8, len: usize) -> Result<()> {
    if ptr.is_null() || len == 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        use nix::sys::mman::mlock;

        let (aligned_addr, aligned_len) = page_span(ptr, len);
        let mut counts = PAGE_LOCKS.lock();
        match mlock(aligned_addr as *const libc::c_void, aligned_len) {
            Ok(()) => {
                retain_pages(&mut counts, aligned_addr, aligned_len, page_size());
                debug!("Locked {} bytes of memory", aligned_len);
                Ok(())
            }
            Err(e) => Err(CustodyError::Resource(format!("mlock failed: {}", e))),
        }
    }

    #[cfg(target_os = "macos")]
    {
        let (aligned_addr, aligned_len) = page_span(ptr, len);
        let mut counts = PAGE_LOCKS.lock();
        if libc::mlock(aligned_addr as *const libc::c_void, aligned_len) == 0 {
            retain_pages(&mut counts, aligned_addr, aligned_len, page_size());
            debug!("Locked {} bytes of memory", aligned_len);
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            Err(CustodyError::Resource(format!("mlock failed: {}", err)))
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(CustodyError::Resource(
            "memory locking not supported on this platform".to_string(),
        ))
    }
}

/// Unlock a previously locked memory region
///
/// # Safety
/// The memory region must have been previously locked with [`lock_memory`]
pub unsafe fn unlock_memory(ptr: *const u8, len: usize) -> Result<()> {
    if ptr.is_null() || len == 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        use nix::sys::mman::munlock;

        let (aligned_addr, aligned_len) = page_span(ptr, len);
        let page_size = page_size();
        let mut counts = PAGE_LOCKS.lock();
        for page in release_pages(&mut counts, aligned_addr, aligned_len, page_size) {
            munlock(page as *const libc::c_void, page_size).map_err(|e| {
                warn!("Failed to unlock memory: {}", e);
                CustodyError::Resource(format!("munlock failed: {}", e))
            })?;
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        let (aligned_addr, aligned_len) = page_span(ptr, len);
        let page_size = page_size();
        let mut counts = PAGE_LOCKS.lock();
        for page in release_pages(&mut counts, aligned_addr, aligned_len, page_size) {
            if libc::munlock(page as *const libc::c_void, page_size) != 0 {
                let err = std::io::Error::last_os_error();
                warn!("Failed to unlock memory: {}", err);
                return Err(CustodyError::Resource(format!("munlock failed: {}", err)));
            }
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Ok(())
    }
}

/// What process-level protection could be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProtection {
    pub core_dumps_disabled: bool,
    pub mlock_available: bool,
}

/// Set up memory protection for the process
/// Call this early in main()
pub fn setup_memory_protection(disable_core_dumps: bool) -> MemoryProtection {
    let mut core_dumps_disabled = false;

    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{setrlimit, Resource};

        if disable_core_dumps {
            match setrlimit(Resource::RLIMIT_CORE, 0, 0) {
                Ok(()) => {
                    debug!("Core dumps disabled");
                    core_dumps_disabled = true;
                }
                Err(e) => warn!("Could not disable core dumps: {}", e),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        if disable_core_dumps {
            warn!("Disabling core dumps is not supported on this platform");
        }
    }

    let mlock_available = can_lock_memory();
    if mlock_available {
        debug!("Memory locking is available");
    } else {
        warn!("Memory locking may not be available - consider increasing RLIMIT_MEMLOCK");
    }

    MemoryProtection {
        core_dumps_disabled,
        mlock_available,
    }
}
