//! Device Registry Module
//!
//! Table of attached crypto accelerators with reference counting,
//! locality-aware selection and start/stop lifecycle.

pub mod device_registry;
pub mod events;
pub mod lease;
pub mod stats;

pub use device_registry::*;
pub use events::*;
pub use lease::*;
pub use stats::*;
