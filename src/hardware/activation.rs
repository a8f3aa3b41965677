//! Algorithm Activation
//!
//! Crypto algorithm registration is process-wide while devices start and
//! stop individually. The activation counter tracks how many devices are
//! started and only talks to the registrar on the first start and the last
//! stop.

use crate::domain::ports::AlgorithmRegistrar;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// Result of a counter transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The registrar was called (0 -> 1 or 1 -> 0)
    Edge,
    /// Only the counter moved
    Counted,
}

/// Shared activation counter in front of an `AlgorithmRegistrar`
pub struct AlgorithmActivation {
    registrar: Arc<dyn AlgorithmRegistrar>,
    /// Number of started devices. Held across registrar calls.
    active: Mutex<usize>,
}

impl std::fmt::Debug for AlgorithmActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmActivation")
            .field("active", &*self.active.lock())
            .finish()
    }
}

impl AlgorithmActivation {
    pub fn new(registrar: Arc<dyn AlgorithmRegistrar>) -> Self {
        Self {
            registrar,
            active: Mutex::new(0),
        }
    }

    /// Number of devices currently holding an activation
    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    /// Check whether algorithms are currently registered
    pub fn is_registered(&self) -> bool {
        self.active() > 0
    }

    /// Take an activation, registering algorithms on the first one.
    ///
    /// On registrar failure the counter is left unchanged.
    pub fn activate(&self) -> Result<Transition> {
        let mut active = self.active.lock();
        if *active == 0 {
            if let Err(e) = self.registrar.register() {
                error!(error = %e, "Failed to register crypto algorithms");
                return Err(e);
            }
            *active = 1;
            info!("Crypto algorithms registered");
            return Ok(Transition::Edge);
        }
        *active += 1;
        Ok(Transition::Counted)
    }

    /// Drop an activation, unregistering algorithms on the last one.
    ///
    /// Returns `None` if there was no activation to drop.
    pub fn deactivate(&self) -> Option<Transition> {
        let mut active = self.active.lock();
        match *active {
            0 => None,
            1 => {
                self.registrar.unregister();
                *active = 0;
                info!("Crypto algorithms unregistered");
                Some(Transition::Edge)
            }
            _ => {
                *active -= 1;
                Some(Transition::Counted)
            }
        }
    }
}
