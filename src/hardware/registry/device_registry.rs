//! Device Registry
//!
//! Table of attached virtio crypto devices. Attach/detach paths add and
//! remove devices under the write lock; the submission path selects a
//! device under the read lock and takes a reference on it before the lock
//! is dropped, so a concurrent remove can never race an in-progress scan.

use super::events::RegistryEvent;
use super::lease::DeviceLease;
use super::stats::{RegistryStats, RegistryStatsSnapshot};
use crate::config::RegistryConfig;
use crate::domain::ports::{AlgorithmRegistrar, ModulePinner};
use crate::error::{Error, Result};
use crate::hardware::activation::{AlgorithmActivation, Transition};
use crate::hardware::allocation::{SelectionEngine, SelectionPath};
use crate::hardware::device::{CryptoDevice, DeviceId, NumaNode};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// =============================================================================
// Device Table
// =============================================================================

/// Registered devices plus the id sequence, guarded together
#[derive(Debug)]
struct DeviceTable {
    /// Insertion-ordered, unique by pointer identity
    devices: Vec<Arc<CryptoDevice>>,
    /// Next id to hand out. Never decremented.
    next_id: u32,
}

impl DeviceTable {
    fn position(&self, device: &Arc<CryptoDevice>) -> Option<usize> {
        self.devices.iter().position(|d| Arc::ptr_eq(d, device))
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Registry and lifecycle manager for a pool of crypto accelerators
pub struct DeviceRegistry {
    config: RegistryConfig,
    table: RwLock<DeviceTable>,
    /// Serializes start/stop/remove so a device takes at most one activation
    /// and never starts after it has left the table
    lifecycle: Mutex<()>,
    activation: AlgorithmActivation,
    pinner: Arc<dyn ModulePinner>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("capacity", &self.config.capacity)
            .field("count", &self.count())
            .field("activation", &self.activation)
            .finish()
    }
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new(
        config: RegistryConfig,
        registrar: Arc<dyn AlgorithmRegistrar>,
        pinner: Arc<dyn ModulePinner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(config, registrar, pinner))
    }

    /// Create a registry with the default configuration
    pub fn with_defaults(
        registrar: Arc<dyn AlgorithmRegistrar>,
        pinner: Arc<dyn ModulePinner>,
    ) -> Arc<Self> {
        Self::build(RegistryConfig::default(), registrar, pinner)
    }

    fn build(
        config: RegistryConfig,
        registrar: Arc<dyn AlgorithmRegistrar>,
        pinner: Arc<dyn ModulePinner>,
    ) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity);

        Arc::new(Self {
            table: RwLock::new(DeviceTable {
                devices: Vec::with_capacity(config.capacity),
                next_id: 0,
            }),
            config,
            lifecycle: Mutex::new(()),
            activation: AlgorithmActivation::new(registrar),
            pinner,
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.event_sender.send(event);
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add a fully constructed device to the table
    pub fn add(&self, device: &Arc<CryptoDevice>) -> Result<DeviceId> {
        let mut table = self.table.write();

        if table.devices.len() >= self.config.capacity {
            drop(table);
            info!(
                capacity = self.config.capacity,
                device = %device,
                "Only support up to {} devices",
                self.config.capacity
            );
            RegistryStats::bump(&self.stats.capacity_rejections);
            self.emit(RegistryEvent::CapacityReached {
                capacity: self.config.capacity,
            });
            return Err(Error::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }

        if table.position(device).is_some() {
            return Err(Error::AlreadyRegistered {
                device: device.to_string(),
            });
        }

        device.reset_ref_count(self.pinner.as_ref());
        let id = DeviceId(table.next_id);
        table.next_id += 1;
        device.assign_id(id);
        table.devices.push(device.clone());
        let count = table.devices.len();
        drop(table);

        RegistryStats::bump(&self.stats.registrations);
        info!(device = %device, node = %device.node(), count, "Crypto device added");
        self.emit(RegistryEvent::DeviceAdded {
            device_id: id,
            name: device.name().to_string(),
            node: device.node(),
        });

        Ok(id)
    }

    /// Remove a device from the table
    ///
    /// Callers stop the device and drain its references first; neither is
    /// enforced here, but both are reported.
    pub fn remove(&self, device: &Arc<CryptoDevice>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let mut table = self.table.write();
        let position = table.position(device).ok_or_else(|| Error::NotRegistered {
            device: device.to_string(),
        })?;
        table.devices.remove(position);
        let id = device.id();
        device.clear_id();
        let count = table.devices.len();
        drop(table);

        if device.is_started() {
            warn!(device = %device, "Removing a device that is still started");
        }
        if device.is_in_use() {
            warn!(
                device = %device,
                refs = device.ref_count(),
                "Removing a device that is still referenced"
            );
        }

        RegistryStats::bump(&self.stats.removals);
        info!(device = %device.name(), id = ?id, count, "Crypto device removed");
        if let Some(id) = id {
            self.emit(RegistryEvent::DeviceRemoved {
                device_id: id,
                name: device.name().to_string(),
            });
        }

        Ok(())
    }

    /// Snapshot of registered devices in insertion order
    pub fn enumerate(&self) -> Vec<Arc<CryptoDevice>> {
        self.table.read().devices.clone()
    }

    /// First registered device, if any
    pub fn first(&self) -> Option<Arc<CryptoDevice>> {
        self.table.read().devices.first().cloned()
    }

    /// Number of registered devices
    pub fn count(&self) -> usize {
        self.table.read().devices.len()
    }

    /// Upper bound on registered devices
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Check whether this exact device is registered
    pub fn contains(&self, device: &Arc<CryptoDevice>) -> bool {
        self.table.read().position(device).is_some()
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Check whether a device has outstanding references
    pub fn is_in_use(&self, device: &CryptoDevice) -> bool {
        device.is_in_use()
    }

    /// Take a reference on a device, pinning its module on the first one
    pub fn acquire(&self, device: &CryptoDevice) -> Result<()> {
        device.acquire(self.pinner.as_ref()).inspect_err(|e| {
            RegistryStats::bump(&self.stats.pin_failures);
            warn!(device = %device, error = %e, "Failed to acquire crypto device");
        })
    }

    /// Drop a reference taken by `acquire` or a selection
    pub fn release(&self, device: &CryptoDevice) -> Result<()> {
        device.release(self.pinner.as_ref())
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Pick and reference a started device for a NUMA node
    ///
    /// The returned device already carries a reference; the caller must
    /// `release` it exactly once.
    pub fn select_for_locality(&self, node: impl Into<NumaNode>) -> Result<Arc<CryptoDevice>> {
        let node = node.into();
        let table = self.table.read();

        let selected = SelectionEngine::select(&table.devices, node)
            .map(|selection| (selection.device.clone(), selection.path));
        let Some((device, path)) = selected else {
            drop(table);
            RegistryStats::bump(&self.stats.selection_failures);
            debug!(node = %node, "No started crypto device available");
            return Err(Error::NoDeviceAvailable { node: node.0 });
        };

        self.acquire(&device)?;
        drop(table);

        RegistryStats::bump(&self.stats.selections);
        if path == SelectionPath::Fallback {
            RegistryStats::bump(&self.stats.locality_misses);
            info!(node = %node, device = %device, "Could not find a device on node");
            if let Some(id) = device.id() {
                self.emit(RegistryEvent::LocalityMiss {
                    requested: node,
                    device_id: id,
                });
            }
        } else {
            debug!(
                node = %node,
                device = %device,
                refs = device.ref_count(),
                "Selected crypto device"
            );
        }

        Ok(device)
    }

    /// Like `select_for_locality`, releasing the device when the lease drops
    pub fn lease_for_locality(self: &Arc<Self>, node: impl Into<NumaNode>) -> Result<DeviceLease> {
        let device = self.select_for_locality(node)?;
        Ok(DeviceLease::new(self.clone(), device))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Check whether a device has been started
    pub fn is_started(&self, device: &CryptoDevice) -> bool {
        device.is_started()
    }

    /// Make a registered device eligible for selection
    ///
    /// The first started device registers the crypto algorithms for the
    /// whole pool. Starting an already started device does nothing.
    pub fn start(&self, device: &Arc<CryptoDevice>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        if !self.contains(device) {
            return Err(Error::NotRegistered {
                device: device.to_string(),
            });
        }
        if device.is_started() {
            debug!(device = %device, "Crypto device already started");
            return Ok(());
        }

        let transition = self.activation.activate().map_err(|e| match e {
            Error::AlgorithmRegistrationFailed(_) => e,
            other => Error::AlgorithmRegistrationFailed(other.to_string()),
        })?;
        if transition == Transition::Edge {
            self.emit(RegistryEvent::AlgorithmsRegistered);
        }

        device.set_started(true);
        info!(device = %device, "Crypto device started");
        if let Some(id) = device.id() {
            self.emit(RegistryEvent::DeviceStarted { device_id: id });
        }
        Ok(())
    }

    /// Withdraw a device from selection
    ///
    /// The last stopped device unregisters the crypto algorithms. Stopping a
    /// device that is not started does nothing.
    pub fn stop(&self, device: &Arc<CryptoDevice>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();

        if !device.is_started() {
            debug!(device = %device, "Crypto device not started");
            return Ok(());
        }

        if self.activation.deactivate() == Some(Transition::Edge) {
            self.emit(RegistryEvent::AlgorithmsUnregistered);
        }

        device.set_started(false);
        info!(device = %device, "Crypto device stopped");
        if let Some(id) = device.id() {
            self.emit(RegistryEvent::DeviceStopped { device_id: id });
        }
        Ok(())
    }

    /// Stop and remove every registered device
    ///
    /// Returns the number of devices removed.
    pub fn teardown(&self) -> usize {
        let mut removed = 0;
        for device in self.enumerate() {
            if device.is_in_use() {
                warn!(
                    device = %device,
                    refs = device.ref_count(),
                    "Tearing down a device that is still referenced"
                );
            }
            // stop() never fails
            let _ = self.stop(&device);
            match self.remove(&device) {
                Ok(()) => removed += 1,
                Err(e) => debug!(device = %device, error = %e, "Device already removed"),
            }
        }
        info!(removed, "Device registry torn down");
        removed
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Number of devices holding an algorithm activation
    pub fn active_algorithms(&self) -> usize {
        self.activation.active()
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        let (devices, started) = {
            let table = self.table.read();
            let started = table.devices.iter().filter(|d| d.is_started()).count();
            (table.devices.len(), started)
        };
        self.stats.snapshot(devices, started, self.activation.active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ModuleHandle, ModuleRefTracker};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct TestRegistrar {
        registers: AtomicUsize,
        unregisters: AtomicUsize,
        fail: AtomicBool,
    }

    impl AlgorithmRegistrar for TestRegistrar {
        fn register(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::AlgorithmRegistrationFailed("skcipher".into()));
            }
            self.registers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unregister(&self) {
            self.unregisters.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        registrar: Arc<TestRegistrar>,
        tracker: Arc<ModuleRefTracker>,
    }

    fn fixture() -> Fixture {
        fixture_with(RegistryConfig::default())
    }

    fn fixture_with(config: RegistryConfig) -> Fixture {
        let registrar = Arc::new(TestRegistrar::default());
        let tracker = ModuleRefTracker::new();
        let registry = DeviceRegistry::new(config, registrar.clone(), tracker.clone()).unwrap();
        Fixture {
            registry,
            registrar,
            tracker,
        }
    }

    fn device(name: &str, node: i32) -> Arc<CryptoDevice> {
        CryptoDevice::new(name, NumaNode(node), ModuleHandle::new("virtio_crypto"))
    }

    fn started(registry: &DeviceRegistry, name: &str, node: i32, refs: u32) -> Arc<CryptoDevice> {
        let dev = device(name, node);
        registry.add(&dev).unwrap();
        registry.start(&dev).unwrap();
        for _ in 0..refs {
            registry.acquire(&dev).unwrap();
        }
        dev
    }

    #[test]
    fn test_capacity_bound() {
        let f = fixture();
        let devices: Vec<_> = (0..33).map(|i| device(&format!("vcrypto{i}"), 0)).collect();

        for dev in &devices[..32] {
            f.registry.add(dev).unwrap();
        }
        assert_matches!(
            f.registry.add(&devices[32]),
            Err(Error::CapacityExceeded { capacity: 32 })
        );
        assert_eq!(f.registry.count(), 32);
        assert_eq!(devices[32].id(), None);
        assert_eq!(f.registry.stats().capacity_rejections, 1);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let f = fixture();
        let dev = device("vcrypto0", 0);

        f.registry.add(&dev).unwrap();
        assert_matches!(f.registry.add(&dev), Err(Error::AlreadyRegistered { .. }));
        assert_eq!(f.registry.count(), 1);
    }

    #[test]
    fn test_add_assigns_sequential_ids() {
        let f = fixture();
        let a = device("a", 0);
        let b = device("b", 0);

        assert_eq!(f.registry.add(&a).unwrap(), DeviceId(0));
        assert_eq!(f.registry.add(&b).unwrap(), DeviceId(1));
        assert_eq!(b.id(), Some(DeviceId(1)));
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let f = fixture();
        let a = device("a", 0);
        let b = device("b", 0);
        let c = device("c", 0);

        f.registry.add(&a).unwrap();
        f.registry.add(&b).unwrap();
        f.registry.remove(&a).unwrap();
        assert_eq!(a.id(), None);

        assert_eq!(f.registry.add(&c).unwrap(), DeviceId(2));
        assert_eq!(f.registry.count(), 2);
    }

    #[test]
    fn test_remove_shrinks_table() {
        let f = fixture();
        let a = device("a", 0);
        let b = device("b", 1);
        f.registry.add(&a).unwrap();
        f.registry.add(&b).unwrap();

        f.registry.remove(&a).unwrap();

        let remaining = f.registry.enumerate();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
        assert!(!f.registry.contains(&a));
        assert_eq!(f.registry.count(), 1);
    }

    #[test]
    fn test_remove_absent_device_fails() {
        let f = fixture();
        let a = device("a", 0);
        assert_matches!(f.registry.remove(&a), Err(Error::NotRegistered { .. }));
        assert_eq!(f.registry.count(), 0);
    }

    #[test]
    fn test_enumerate_and_first_keep_insertion_order() {
        let f = fixture();
        assert!(f.registry.first().is_none());
        assert!(f.registry.is_empty());

        let names = ["x", "y", "z"];
        for name in names {
            f.registry.add(&device(name, 0)).unwrap();
        }

        let listed: Vec<_> = f
            .registry
            .enumerate()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(listed, names);
        assert_eq!(f.registry.first().unwrap().name(), "x");
    }

    #[test]
    fn test_refcount_balance() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        f.registry.add(&dev).unwrap();

        for _ in 0..5 {
            f.registry.acquire(&dev).unwrap();
        }
        for _ in 0..3 {
            f.registry.release(&dev).unwrap();
        }
        assert_eq!(dev.ref_count(), 2);
        assert!(f.registry.is_in_use(&dev));
        assert_eq!(f.tracker.pin_count(dev.owner()), 1);

        f.registry.release(&dev).unwrap();
        f.registry.release(&dev).unwrap();
        assert!(!f.registry.is_in_use(&dev));
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);
        assert_matches!(
            f.registry.release(&dev),
            Err(Error::ReferenceUnderflow { .. })
        );
    }

    #[test]
    fn test_pin_failure_is_rolled_back() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        f.registry.add(&dev).unwrap();
        f.tracker.begin_unload(dev.owner()).unwrap();

        assert_matches!(
            f.registry.acquire(&dev),
            Err(Error::ModulePinFailed { .. })
        );
        assert_eq!(dev.ref_count(), 0);
        assert_eq!(f.registry.stats().pin_failures, 1);
    }

    #[test]
    fn test_readd_with_outstanding_references_drops_pin() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        f.registry.add(&dev).unwrap();
        f.registry.acquire(&dev).unwrap();
        f.registry.remove(&dev).unwrap();

        f.registry.add(&dev).unwrap();
        assert_eq!(dev.ref_count(), 0);
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);

        // The stale holder's release is now a caller bug, not a pin leak
        assert_matches!(
            f.registry.release(&dev),
            Err(Error::ReferenceUnderflow { .. })
        );
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);

        f.registry.acquire(&dev).unwrap();
        f.registry.release(&dev).unwrap();
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);
    }

    #[test]
    fn test_select_propagates_pin_failure() {
        let f = fixture();
        let dev = started(&f.registry, "vcrypto0", 0, 0);
        f.tracker.begin_unload(dev.owner()).unwrap();

        assert_matches!(
            f.registry.select_for_locality(0),
            Err(Error::ModulePinFailed { .. })
        );
        assert_eq!(dev.ref_count(), 0);
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);

        let stats = f.registry.stats();
        assert_eq!(stats.selections, 0);
        assert_eq!(stats.pin_failures, 1);
    }

    #[test]
    fn test_select_prefers_locality() {
        let f = fixture();
        let a = started(&f.registry, "a", 0, 3);
        let b = started(&f.registry, "b", 1, 1);

        let chosen = f.registry.select_for_locality(1).unwrap();
        assert!(Arc::ptr_eq(&chosen, &b));
        assert_eq!(b.ref_count(), 2);

        let chosen = f.registry.select_for_locality(0).unwrap();
        assert!(Arc::ptr_eq(&chosen, &a));
        assert_eq!(a.ref_count(), 4);
    }

    #[test]
    fn test_select_least_loaded() {
        let f = fixture();
        let _a = started(&f.registry, "a", 0, 5);
        let c = started(&f.registry, "c", 0, 2);

        let chosen = f.registry.select_for_locality(0).unwrap();
        assert!(Arc::ptr_eq(&chosen, &c));
    }

    #[test]
    fn test_select_falls_back_to_any_started() {
        let f = fixture();
        let d = started(&f.registry, "d", 2, 0);

        let chosen = f.registry.select_for_locality(5).unwrap();
        assert!(Arc::ptr_eq(&chosen, &d));
        assert_eq!(d.ref_count(), 1);
        assert_eq!(f.tracker.pin_count(d.owner()), 1);

        let stats = f.registry.stats();
        assert_eq!(stats.selections, 1);
        assert_eq!(stats.locality_misses, 1);
    }

    #[test]
    fn test_select_without_started_devices() {
        let f = fixture();
        assert_matches!(
            f.registry.select_for_locality(0),
            Err(Error::NoDeviceAvailable { node: 0 })
        );

        let idle = device("idle", 0);
        f.registry.add(&idle).unwrap();
        assert_matches!(
            f.registry.select_for_locality(0),
            Err(Error::NoDeviceAvailable { .. })
        );
        assert_eq!(idle.ref_count(), 0);
        assert_eq!(f.registry.stats().selection_failures, 2);
    }

    #[test]
    fn test_start_stop_toggles() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        f.registry.add(&dev).unwrap();

        assert_ok!(f.registry.start(&dev));
        assert!(f.registry.is_started(&dev));
        assert_ok!(f.registry.stop(&dev));
        assert!(!f.registry.is_started(&dev));
        assert_ok!(f.registry.start(&dev));
        assert!(f.registry.is_started(&dev));

        assert_eq!(f.registrar.registers.load(Ordering::SeqCst), 2);
        assert_eq!(f.registrar.unregisters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_start_leaves_device_stopped() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        f.registry.add(&dev).unwrap();
        f.registrar.fail.store(true, Ordering::SeqCst);

        assert_matches!(
            f.registry.start(&dev),
            Err(Error::AlgorithmRegistrationFailed(_))
        );
        assert!(!f.registry.is_started(&dev));
        assert_eq!(f.registry.active_algorithms(), 0);
    }

    #[test]
    fn test_start_requires_registration() {
        let f = fixture();
        let dev = device("vcrypto0", 0);
        assert_matches!(f.registry.start(&dev), Err(Error::NotRegistered { .. }));
        assert_ok!(f.registry.stop(&dev));
        assert_err!(f.registry.remove(&dev));
        assert_eq!(f.registrar.registers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_algorithms_shared_across_devices() {
        let f = fixture();
        let a = started(&f.registry, "a", 0, 0);
        let b = started(&f.registry, "b", 1, 0);

        // Repeated start does not take a second activation
        f.registry.start(&a).unwrap();
        assert_eq!(f.registry.active_algorithms(), 2);
        assert_eq!(f.registrar.registers.load(Ordering::SeqCst), 1);

        f.registry.stop(&a).unwrap();
        assert_eq!(f.registrar.unregisters.load(Ordering::SeqCst), 0);
        f.registry.stop(&a).unwrap();
        f.registry.stop(&b).unwrap();
        assert_eq!(f.registrar.unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(f.registry.active_algorithms(), 0);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let f = fixture();
        let dev = started(&f.registry, "vcrypto0", 0, 0);

        {
            let lease = f.registry.lease_for_locality(0).unwrap();
            assert_eq!(lease.name(), "vcrypto0");
            assert_eq!(dev.ref_count(), 1);
        }
        assert_eq!(dev.ref_count(), 0);
        assert_eq!(f.tracker.pin_count(dev.owner()), 0);
    }

    #[test]
    fn test_teardown_removes_everything() {
        let f = fixture();
        started(&f.registry, "a", 0, 0);
        started(&f.registry, "b", 1, 0);
        f.registry.add(&device("c", 2)).unwrap();

        assert_eq!(f.registry.teardown(), 3);
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.active_algorithms(), 0);
        assert_eq!(f.registrar.unregisters.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_small_capacity_from_config() {
        let f = fixture_with(RegistryConfig {
            capacity: 1,
            ..Default::default()
        });
        f.registry.add(&device("a", 0)).unwrap();
        assert_matches!(
            f.registry.add(&device("b", 0)),
            Err(Error::CapacityExceeded { capacity: 1 })
        );
        assert_eq!(f.registry.capacity(), 1);
    }

    #[test]
    fn test_concurrent_select_and_remove() {
        let f = fixture();
        let devices: Vec<_> = (0..8)
            .map(|i| started(&f.registry, &format!("vcrypto{i}"), i % 2, 0))
            .collect();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let registry = &f.registry;
                scope.spawn(move || {
                    for _ in 0..500 {
                        match registry.select_for_locality(worker % 2) {
                            Ok(device) => registry.release(&device).unwrap(),
                            Err(e) => assert_matches!(e, Error::NoDeviceAvailable { .. }),
                        }
                    }
                });
            }

            let registry = &f.registry;
            let devices = &devices;
            scope.spawn(move || {
                for device in devices {
                    registry.stop(device).unwrap();
                    registry.remove(device).unwrap();
                }
            });
        });

        assert!(f.registry.is_empty());
        for device in &devices {
            assert_eq!(device.ref_count(), 0);
        }
        assert_eq!(f.tracker.pin_count(&ModuleHandle::new("virtio_crypto")), 0);
    }

    #[test]
    fn test_start_never_lands_after_concurrent_remove() {
        let f = fixture();
        let mut events = f.registry.subscribe();

        for _ in 0..200 {
            let dev = device("vcrypto0", 0);
            f.registry.add(&dev).unwrap();

            let started = std::thread::scope(|scope| {
                let starter = scope.spawn(|| f.registry.start(&dev));
                f.registry.remove(&dev).unwrap();
                starter.join().unwrap()
            });

            let mut seen = Vec::new();
            while let Ok(event) = events.try_recv() {
                seen.push(event);
            }
            let started_at = seen
                .iter()
                .position(|e| matches!(e, RegistryEvent::DeviceStarted { .. }));
            let removed_at = seen
                .iter()
                .position(|e| matches!(e, RegistryEvent::DeviceRemoved { .. }));

            match started {
                Ok(()) => assert!(started_at.unwrap() < removed_at.unwrap()),
                Err(e) => {
                    assert_matches!(e, Error::NotRegistered { .. });
                    assert!(!dev.is_started());
                    assert_eq!(f.registry.active_algorithms(), 0);
                }
            }

            f.registry.stop(&dev).unwrap();
            assert_eq!(f.registry.active_algorithms(), 0);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let f = fixture();
        let mut events = f.registry.subscribe();
        let dev = device("vcrypto0", 0);

        f.registry.add(&dev).unwrap();
        f.registry.start(&dev).unwrap();
        f.registry.stop(&dev).unwrap();
        f.registry.remove(&dev).unwrap();

        let expected = vec![
            RegistryEvent::DeviceAdded {
                device_id: DeviceId(0),
                name: "vcrypto0".into(),
                node: NumaNode(0),
            },
            RegistryEvent::AlgorithmsRegistered,
            RegistryEvent::DeviceStarted {
                device_id: DeviceId(0),
            },
            RegistryEvent::AlgorithmsUnregistered,
            RegistryEvent::DeviceStopped {
                device_id: DeviceId(0),
            },
            RegistryEvent::DeviceRemoved {
                device_id: DeviceId(0),
                name: "vcrypto0".into(),
            },
        ];
        for event in expected {
            assert_eq!(events.recv().await.unwrap(), event);
        }
    }

    #[tokio::test]
    async fn test_locality_miss_event() {
        let f = fixture();
        let dev = started(&f.registry, "d", 2, 0);
        let mut events = f.registry.subscribe();

        let chosen = f.registry.select_for_locality(5).unwrap();
        f.registry.release(&chosen).unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::LocalityMiss {
                requested: NumaNode(5),
                device_id: dev.id().unwrap(),
            }
        );
    }
}
