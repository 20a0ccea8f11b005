//! Error taxonomy shared by every TDDS subsystem.

use thiserror::Error;

/// Result type for TDDS operations.
pub type Result<T> = std::result::Result<T, DdsError>;

/// Discriminated error kinds returned by the runtime.
///
/// Pool and codec failures return by value to the caller; send-path I/O
/// failures are logged and counted instead of surfacing here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DdsError {
    /// Pool exhaustion; the caller may retry after releasing resources.
    #[error("out of pool memory")]
    NoMemory,

    /// API misuse; never retried.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Socket slots, locator limits or parse buffers exhausted.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Operation attempted out of sequence (double add, init before pre-init).
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// OS-level create/bind failure; terminal for the calling operation.
    #[error("already deleted: {0}")]
    AlreadyDeleted(String),

    /// Feature disabled by build or runtime configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Unrecoverable invariant break.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DdsError {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        DdsError::BadParameter(msg.into())
    }

    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        DdsError::OutOfResources(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        DdsError::PreconditionNotMet(msg.into())
    }

    pub fn already_deleted(msg: impl Into<String>) -> Self {
        DdsError::AlreadyDeleted(msg.into())
    }
}
