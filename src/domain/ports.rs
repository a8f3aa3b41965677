//! Domain Ports - Collaborator traits for the device manager
//!
//! These traits define the boundaries between the registry and the rest of
//! the driver. The algorithm layer and the module loader implement them.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Module Handle
// =============================================================================

/// Opaque handle to the code module implementing a device's operations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub String);

impl ModuleHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModuleHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModuleHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Process-wide crypto algorithm registration
///
/// Registering makes the accelerated algorithms visible to crypto API users;
/// unregistering withdraws them. Neither call takes a device: the scope is the
/// whole pool.
pub trait AlgorithmRegistrar: Send + Sync {
    /// Register the accelerated algorithms
    fn register(&self) -> Result<()>;

    /// Unregister the accelerated algorithms
    fn unregister(&self);
}

/// Keeps a code module loaded while a device it implements is referenced
pub trait ModulePinner: Send + Sync {
    /// Try to take a pin on the module. Returns false if the module is going away.
    fn try_pin(&self, module: &ModuleHandle) -> bool;

    /// Drop a pin taken by a successful `try_pin`
    fn unpin(&self, module: &ModuleHandle);
}

// =============================================================================
// In-process Module Tracker
// =============================================================================

#[derive(Debug, Default)]
struct ModuleState {
    pins: u64,
    unloading: bool,
}

/// In-process `ModulePinner` that counts pins per module
///
/// Once `begin_unload` succeeds for a module, further pins are refused until
/// `cancel_unload` is called.
#[derive(Debug, Default)]
pub struct ModuleRefTracker {
    modules: Mutex<HashMap<ModuleHandle, ModuleState>>,
}

impl ModuleRefTracker {
    /// Create a new tracker
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of pins currently held on a module
    pub fn pin_count(&self, module: &ModuleHandle) -> u64 {
        self.modules.lock().get(module).map_or(0, |s| s.pins)
    }

    /// Check whether a module is marked as unloading
    pub fn is_unloading(&self, module: &ModuleHandle) -> bool {
        self.modules.lock().get(module).is_some_and(|s| s.unloading)
    }

    /// Mark a module as unloading. Fails while any pin is held.
    pub fn begin_unload(&self, module: &ModuleHandle) -> Result<()> {
        let mut modules = self.modules.lock();
        let state = modules.entry(module.clone()).or_default();
        if state.pins > 0 {
            return Err(Error::ModuleBusy {
                module: module.to_string(),
                pins: state.pins,
            });
        }
        state.unloading = true;
        info!(module = %module, "Module unload started");
        Ok(())
    }

    /// Allow pins on a module again
    pub fn cancel_unload(&self, module: &ModuleHandle) {
        if let Some(state) = self.modules.lock().get_mut(module) {
            state.unloading = false;
        }
    }
}

impl ModulePinner for ModuleRefTracker {
    fn try_pin(&self, module: &ModuleHandle) -> bool {
        let mut modules = self.modules.lock();
        let state = modules.entry(module.clone()).or_default();
        if state.unloading {
            debug!(module = %module, "Refusing pin on unloading module");
            return false;
        }
        state.pins += 1;
        true
    }

    fn unpin(&self, module: &ModuleHandle) {
        let mut modules = self.modules.lock();
        if let Some(state) = modules.get_mut(module) {
            state.pins = state.pins.saturating_sub(1);
        }
    }
}
