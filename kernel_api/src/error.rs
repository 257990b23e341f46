//! Kernel error types

use thiserror::Error;

/// Errors the underlying capability kernel can report.
///
/// The supervisor never retries a denied operation; retries, when
/// desired, are a policy of the layer above.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The kernel refused the operation
    #[error("operation denied by the kernel")]
    Denied,

    /// A handle did not name a live kernel object
    #[error("invalid capability: {0}")]
    InvalidCapability(String),

    /// The kernel ran out of a resource needed for the operation
    #[error("kernel resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The named object does not exist
    #[error("kernel object not found")]
    ObjectNotFound,
}
