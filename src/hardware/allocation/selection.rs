//! Locality-Aware Selection
//!
//! Picks the device a request for a given NUMA node should be submitted to.
//! Started devices local to the node (or with unknown locality) are
//! preferred, least-referenced first. When none qualifies, the first started
//! device in insertion order is used instead.

use crate::hardware::device::{CryptoDevice, NumaNode};
use std::sync::Arc;

// =============================================================================
// Selection Result
// =============================================================================

/// How a device was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPath {
    /// Device serves the requested node; least loaded among those
    Local,
    /// No device served the node; first started device
    Fallback,
}

/// A chosen device and the path that chose it
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub device: &'a Arc<CryptoDevice>,
    pub path: SelectionPath,
}

// =============================================================================
// Selection Engine
// =============================================================================

/// Engine for choosing a device for a locality hint
pub struct SelectionEngine;

impl SelectionEngine {
    /// Select a device for `node` from an insertion-ordered slice.
    ///
    /// Reference counts are read once per device; the caller is expected to
    /// hold the registry read lock so membership cannot change mid-scan.
    pub fn select(devices: &[Arc<CryptoDevice>], node: NumaNode) -> Option<Selection<'_>> {
        if let Some(device) = Self::least_loaded_local(devices, node) {
            return Some(Selection {
                device,
                path: SelectionPath::Local,
            });
        }

        Self::first_started(devices).map(|device| Selection {
            device,
            path: SelectionPath::Fallback,
        })
    }

    /// Least-referenced started device serving `node`; earliest wins ties
    fn least_loaded_local(
        devices: &[Arc<CryptoDevice>],
        node: NumaNode,
    ) -> Option<&Arc<CryptoDevice>> {
        let mut best: Option<(&Arc<CryptoDevice>, u32)> = None;

        for device in devices {
            if !device.is_started() || !device.node().serves(node) {
                continue;
            }
            let load = device.ref_count();
            match best {
                Some((_, best_load)) if best_load <= load => {}
                _ => best = Some((device, load)),
            }
        }

        best.map(|(device, _)| device)
    }

    /// First started device regardless of locality
    fn first_started(devices: &[Arc<CryptoDevice>]) -> Option<&Arc<CryptoDevice>> {
        devices.iter().find(|device| device.is_started())
    }
}
