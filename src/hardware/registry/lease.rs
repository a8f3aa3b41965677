//! Device Lease
//!
//! RAII form of a selected device: the reference taken by selection is
//! released when the lease is dropped.

use super::DeviceRegistry;
use crate::hardware::device::CryptoDevice;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// A referenced device that releases itself on drop
#[derive(Debug)]
pub struct DeviceLease {
    registry: Arc<DeviceRegistry>,
    device: Arc<CryptoDevice>,
}

impl DeviceLease {
    pub(crate) fn new(registry: Arc<DeviceRegistry>, device: Arc<CryptoDevice>) -> Self {
        Self { registry, device }
    }

    /// The leased device
    pub fn device(&self) -> &Arc<CryptoDevice> {
        &self.device
    }
}

impl Deref for DeviceLease {
    type Target = CryptoDevice;

    fn deref(&self) -> &CryptoDevice {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release(&self.device) {
            warn!(device = %self.device, error = %e, "Failed to release leased device");
        }
    }
}
