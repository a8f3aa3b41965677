//! Registry Statistics
//!
//! Counters updated on the registry paths and a serializable snapshot of
//! them for logging and the simulation report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters across the registry lifetime
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Successful adds
    pub registrations: AtomicU64,
    /// Successful removes
    pub removals: AtomicU64,
    /// Adds refused for capacity
    pub capacity_rejections: AtomicU64,
    /// Successful selections
    pub selections: AtomicU64,
    /// Selections served by the fallback path
    pub locality_misses: AtomicU64,
    /// Selections that found no started device
    pub selection_failures: AtomicU64,
    /// Acquires refused by the module pinner
    pub pin_failures: AtomicU64,
}

impl RegistryStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of current stats
    pub fn snapshot(
        &self,
        devices: usize,
        started: usize,
        active_algorithms: usize,
    ) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            taken_at: Utc::now(),
            devices,
            started,
            active_algorithms,
            registrations: self.registrations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            selections: self.selections.load(Ordering::Relaxed),
            locality_misses: self.locality_misses.load(Ordering::Relaxed),
            selection_failures: self.selection_failures.load(Ordering::Relaxed),
            pin_failures: self.pin_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub devices: usize,
    pub started: usize,
    pub active_algorithms: usize,
    pub registrations: u64,
    pub removals: u64,
    pub capacity_rejections: u64,
    pub selections: u64,
    pub locality_misses: u64,
    pub selection_failures: u64,
    pub pin_failures: u64,
}

impl RegistryStatsSnapshot {
    /// Fraction of successful selections that missed locality
    pub fn locality_miss_ratio(&self) -> f64 {
        if self.selections == 0 {
            0.0
        } else {
            self.locality_misses as f64 / self.selections as f64
        }
    }
}
