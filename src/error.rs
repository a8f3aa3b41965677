//! Error types for the virtio crypto device manager
//!
//! Provides structured error types for registry membership, reference
//! counting, algorithm activation and device selection.

use thiserror::Error;

/// Unified error type for the device manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Registry Membership Errors
    // =========================================================================
    #[error("Device registry full: only {capacity} devices supported")]
    CapacityExceeded { capacity: usize },

    #[error("Device already registered: {device}")]
    AlreadyRegistered { device: String },

    #[error("Device not registered: {device}")]
    NotRegistered { device: String },

    // =========================================================================
    // Reference Counting Errors
    // =========================================================================
    #[error("Failed to pin owning module: {module}")]
    ModulePinFailed { module: String },

    #[error("Reference count underflow on device {device}")]
    ReferenceUnderflow { device: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Failed to register crypto algorithms: {0}")]
    AlgorithmRegistrationFailed(String),

    #[error("Module {module} still pinned {pins} times")]
    ModuleBusy { module: String, pins: u64 },

    // =========================================================================
    // Selection Errors
    // =========================================================================
    #[error("No started crypto device available (requested node {node})")]
    NoDeviceAvailable { node: i32 },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller should do with a failed registry call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The condition is transient; the same call may succeed later
    Retry,
    /// The table is full; retry only after a device has been removed
    RetryAfterRemove,
    /// No accelerator can serve the request; use the software path
    Fallback,
    /// Caller bug or bad configuration; do not retry
    Fatal,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::CapacityExceeded { .. } => ErrorAction::RetryAfterRemove,

            Error::ModulePinFailed { .. }
            | Error::ModuleBusy { .. }
            | Error::AlgorithmRegistrationFailed(_) => ErrorAction::Retry,

            Error::NoDeviceAvailable { .. } => ErrorAction::Fallback,

            Error::AlreadyRegistered { .. }
            | Error::NotRegistered { .. }
            | Error::ReferenceUnderflow { .. }
            | Error::Configuration(_)
            | Error::Yaml(_)
            | Error::Io(_) => ErrorAction::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::Retry | ErrorAction::RetryAfterRemove
        )
    }

    /// Check if this error indicates a broken caller contract
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            Error::AlreadyRegistered { .. }
                | Error::NotRegistered { .. }
                | Error::ReferenceUnderflow { .. }
        )
    }
}

/// Result type alias for the device manager
pub type Result<T> = std::result::Result<T, Error>;
