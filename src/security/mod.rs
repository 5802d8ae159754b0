//! Security utilities for secret lifetime and runtime trust
//!
//! This module provides:
//! - Multi-pass wiping of sensitive buffers
//! - Memory locking to prevent swap, core dump suppression
//! - Runtime environment checks (debugger, virtualization, analysis tools)
//! - Content-hash integrity verification of application components

pub mod integrity;
pub mod mlock;
pub mod monitor;
pub mod wipe;

pub use integrity::{ApplicationIntegrity, Component, IntegrityVerifier};
pub use mlock::{can_lock_memory, setup_memory_protection, MemoryProtection};
pub use monitor::{
    obfuscate, AnalysisToolDetector, DebuggerDetector, Detector, Finding, RuntimeMonitor,
    RuntimeStatus, VirtualizationDetector,
};
pub use wipe::{secure_wipe, secure_wipe_vec, SecureBuffer};
