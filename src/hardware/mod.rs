//! Hardware Module
//!
//! Device instances, the device registry, algorithm activation and
//! locality-aware device selection.

pub mod activation;
pub mod allocation;
pub mod device;
pub mod registry;

pub use activation::*;
pub use allocation::*;
pub use device::*;
pub use registry::*;
