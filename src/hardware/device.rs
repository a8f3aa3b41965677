//! Crypto Device Instance
//!
//! One attached virtio crypto accelerator as seen by the registry. The
//! driver context constructs the device and shares it as an `Arc`; the
//! registry only keeps clones of that `Arc`.

use crate::domain::ports::{ModuleHandle, ModulePinner};
use crate::error::{Error, Result};
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Constants
// =============================================================================

/// Sentinel stored in the id slot while a device is not registered
const UNASSIGNED_ID: u32 = u32::MAX;

// =============================================================================
// Device ID
// =============================================================================

/// Registry-assigned device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// NUMA Locality
// =============================================================================

/// NUMA node of the transport device backing an accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumaNode(pub i32);

impl NumaNode {
    /// Locality not reported by the transport
    pub const UNKNOWN: NumaNode = NumaNode(-1);

    pub fn new(node: i32) -> Self {
        Self(node)
    }

    /// Check whether the transport reported a node
    #[inline]
    pub fn is_known(&self) -> bool {
        self.0 >= 0
    }

    /// A device on `self` serves requests for `requested` if the nodes are
    /// equal or the device locality is unknown.
    #[inline]
    pub fn serves(&self, requested: NumaNode) -> bool {
        *self == requested || !self.is_known()
    }
}

impl std::fmt::Display for NumaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_known() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "unknown")
        }
    }
}

impl From<i32> for NumaNode {
    fn from(node: i32) -> Self {
        Self(node)
    }
}

// =============================================================================
// Status Flags
// =============================================================================

bitflags! {
    /// Device status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u32 {
        /// Transport is ready and the device may be selected
        const STARTED = 1 << 0;
    }
}

// =============================================================================
// Crypto Device
// =============================================================================

/// A virtio crypto accelerator instance
pub struct CryptoDevice {
    /// Label used in logs and events
    name: String,
    /// Locality of the backing transport
    node: NumaNode,
    /// Module implementing this device's operations
    owner: ModuleHandle,
    /// Registry id, `UNASSIGNED_ID` while not registered
    id: AtomicU32,
    /// Outstanding references handed to submitters
    ref_count: AtomicU32,
    /// `DeviceStatus` bits
    status: AtomicU32,
    /// Serializes the 0 <-> 1 reference transitions so that module pins
    /// and unpins strictly alternate
    pin_lock: Mutex<()>,
}

impl std::fmt::Debug for CryptoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoDevice")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("node", &self.node)
            .field("owner", &self.owner)
            .field("ref_count", &self.ref_count())
            .field("status", &self.status())
            .finish()
    }
}

impl std::fmt::Display for CryptoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}#{}", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

impl CryptoDevice {
    /// Create a new, unregistered device
    pub fn new(name: impl Into<String>, node: NumaNode, owner: ModuleHandle) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node,
            owner,
            id: AtomicU32::new(UNASSIGNED_ID),
            ref_count: AtomicU32::new(0),
            status: AtomicU32::new(DeviceStatus::empty().bits()),
            pin_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NumaNode {
        self.node
    }

    pub fn owner(&self) -> &ModuleHandle {
        &self.owner
    }

    /// Registry id, `None` while the device is not registered
    pub fn id(&self) -> Option<DeviceId> {
        match self.id.load(Ordering::Acquire) {
            UNASSIGNED_ID => None,
            id => Some(DeviceId(id)),
        }
    }

    /// Current reference count
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Check whether any holder currently references this device
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.ref_count() != 0
    }

    /// Current status bits
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// Check whether the device has been started
    #[inline]
    pub fn is_started(&self) -> bool {
        self.status().contains(DeviceStatus::STARTED)
    }

    pub(crate) fn set_started(&self, started: bool) {
        let bit = DeviceStatus::STARTED.bits();
        if started {
            self.status.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.status.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub(crate) fn assign_id(&self, id: DeviceId) {
        self.id.store(id.0, Ordering::Release);
    }

    pub(crate) fn clear_id(&self) {
        self.id.store(UNASSIGNED_ID, Ordering::Release);
    }

    /// Reset the reference count on registration
    ///
    /// Outstanding references from an earlier registration are dropped
    /// along with the module pin they held.
    pub(crate) fn reset_ref_count(&self, pinner: &dyn ModulePinner) {
        let _guard = self.pin_lock.lock();
        let previous = self.ref_count.swap(0, Ordering::AcqRel);
        if previous != 0 {
            pinner.unpin(&self.owner);
            warn!(
                device = %self.name,
                previous,
                "Reference count reset while references were outstanding"
            );
        }
    }

    /// Take a reference, pinning the owning module on the first one.
    ///
    /// If the pin is refused the count is left unchanged.
    pub(crate) fn acquire(&self, pinner: &dyn ModulePinner) -> Result<()> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        while current != 0 {
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }

        // Only this path moves the count away from zero, and only under the
        // pin lock, so a zero read here stays zero until we store.
        let _guard = self.pin_lock.lock();
        if self.ref_count.load(Ordering::Acquire) == 0 && !pinner.try_pin(&self.owner) {
            return Err(Error::ModulePinFailed {
                module: self.owner.to_string(),
            });
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference, unpinning the owning module on the last one.
    pub(crate) fn release(&self, pinner: &dyn ModulePinner) -> Result<()> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        while current > 1 {
            match self.ref_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }

        let _guard = self.pin_lock.lock();
        let result = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match result {
            Ok(1) => {
                pinner.unpin(&self.owner);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ReferenceUnderflow {
                device: self.to_string(),
            }),
        }
    }
}
