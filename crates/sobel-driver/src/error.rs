//! Error types for fabric driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced to callers of the driver
///
/// Failures inside interrupt handling are never represented here: there is
/// no caller to return them to, so they are logged and skipped.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Device node or sysfs resource missing
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No fabric detected on the PCI bus
    #[error("No accelerator fabric detected")]
    NoDevicesFound,

    /// I/O error talking to sysfs or a device node
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// No resource record for a process that should have one
    #[error("No resource record for pid {pid}")]
    NoRecord {
        /// Process identifier looked up
        pid: u32,
    },

    /// The process already holds an open handle
    #[error("pid {pid} already has the device open")]
    AlreadyOpen {
        /// Process identifier
        pid: u32,
    },

    /// A buffer the operation needs has not been mmap'd yet
    #[error("{region} buffer is not mapped")]
    NotMapped {
        /// Which buffer is missing
        region: &'static str,
    },

    /// Malformed request
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Request issued in the wrong order or against the wrong state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Unrecognised ioctl command code
    #[error("Unknown ioctl command {cmd}")]
    UnknownCommand {
        /// Raw command code
        cmd: u32,
    },

    /// Kernel-style memory allocation failed
    #[error("Allocation failed: {reason}")]
    AllocationFailed {
        /// Reason for failure
        reason: String,
    },

    /// Image needs more pages than an SG list can describe
    #[error("Image needs {pages} pages, SG lists hold at most {max}")]
    TooManyPages {
        /// Pages required
        pages: usize,
        /// Pages available
        max: usize,
    },

    /// DMA mapping failed
    #[error("DMA mapping failed: {reason}")]
    DmaMapFailed {
        /// Reason for failure
        reason: String,
    },
}

impl DriverError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an allocation failed error
    pub fn allocation_failed(reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            reason: reason.into(),
        }
    }

    /// Create a DMA mapping error
    pub fn dma_map_failed(reason: impl Into<String>) -> Self {
        Self::DmaMapFailed {
            reason: reason.into(),
        }
    }
}
