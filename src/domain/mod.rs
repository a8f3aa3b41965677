//! Domain layer - Collaborator port definitions
//!
//! This module defines the traits (ports) the registry calls out through,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
