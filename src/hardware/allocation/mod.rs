//! Allocation Module
//!
//! Chooses which registered device a submission should use.

pub mod selection;

pub use selection::*;
