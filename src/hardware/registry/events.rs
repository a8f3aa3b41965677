//! Registry Events
//!
//! Events emitted by the device registry for external consumers to react to
//! device lifecycle changes.

use crate::hardware::device::{DeviceId, NumaNode};
use serde::{Deserialize, Serialize};

/// Events emitted by the device registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A device was added to the table
    DeviceAdded {
        device_id: DeviceId,
        name: String,
        node: NumaNode,
    },

    /// A device was removed from the table
    DeviceRemoved { device_id: DeviceId, name: String },

    /// A device became eligible for selection
    DeviceStarted { device_id: DeviceId },

    /// A device stopped accepting work
    DeviceStopped { device_id: DeviceId },

    /// Crypto algorithms became available for the pool
    AlgorithmsRegistered,

    /// Crypto algorithms were withdrawn for the pool
    AlgorithmsUnregistered,

    /// No device served the requested node; another device was used
    LocalityMiss {
        requested: NumaNode,
        device_id: DeviceId,
    },

    /// An add was refused because the table is full
    CapacityReached { capacity: usize },
}

impl RegistryEvent {
    /// Get the device ID associated with this event
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            RegistryEvent::DeviceAdded { device_id, .. }
            | RegistryEvent::DeviceRemoved { device_id, .. }
            | RegistryEvent::DeviceStarted { device_id }
            | RegistryEvent::DeviceStopped { device_id }
            | RegistryEvent::LocalityMiss { device_id, .. } => Some(*device_id),
            _ => None,
        }
    }

    /// Check if this event concerns the whole pool rather than one device
    pub fn is_pool_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::AlgorithmsRegistered
                | RegistryEvent::AlgorithmsUnregistered
                | RegistryEvent::CapacityReached { .. }
        )
    }
}
