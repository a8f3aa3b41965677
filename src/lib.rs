//! Virtio Crypto Device Manager
//!
//! Registry and lifecycle manager for a pool of virtio crypto accelerators.
//! Probe paths add and start devices, detach paths stop and remove them, and
//! the request submission path asks for the best started device for its
//! NUMA node.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │          probe / detach                 request submission           │
//! │   add ─ start ─ stop ─ remove      select_for_locality ─ release     │
//! │               │                               │                      │
//! │   ┌───────────┴───────────────────────────────┴──────────────────┐   │
//! │   │                      Device Registry                          │   │
//! │   │   RwLock<table>  (≤ 32 devices, insertion ordered)            │   │
//! │   │   per-device atomic refcount + module pin on 0 → 1            │   │
//! │   └───────────┬───────────────────────────────┬──────────────────┘   │
//! │               │                               │                      │
//! │   ┌───────────┴───────────┐       ┌───────────┴──────────────┐       │
//! │   │  Algorithm Activation │       │   Module Pinner          │       │
//! │   │  (shared counter)     │       │   (try_pin / unpin)      │       │
//! │   └───────────────────────┘       └──────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`hardware`]: Device instances, registry, selection and activation
//! - [`domain`]: Collaborator traits
//! - [`config`]: Registry configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod hardware;

// Re-export commonly used types
pub use config::{RegistryConfig, MAX_DEVICES};

pub use domain::ports::{AlgorithmRegistrar, ModuleHandle, ModulePinner, ModuleRefTracker};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    AlgorithmActivation, CryptoDevice, DeviceId, DeviceLease, DeviceRegistry, DeviceStatus,
    NumaNode, RegistryEvent, RegistryStatsSnapshot, SelectionEngine, SelectionPath,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
