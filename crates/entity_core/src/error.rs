//! Error types shared by every Vulkan-facing module
//!
//! Recoverable failures surface as `Err(VulkanError)`; unrecoverable
//! initialization failures go through [`fatal`], which gives the log sink a
//! moment to flush before terminating the process.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Resource with specified ID could not be found
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        /// The unique identifier of the resource
        id: u64,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Abort after an unrecoverable initialization failure.
///
/// Waits a few seconds so the log file and stderr have time to flush, then
/// terminates the process. Only construction-time code paths use this; every
/// runtime failure is reported through [`VulkanResult`].
pub fn fatal(msg: &str) -> ! {
    log::error!("FATAL: {msg}");
    std::thread::sleep(std::time::Duration::from_secs(3));
    std::process::exit(-1);
}
