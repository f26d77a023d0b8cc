//! # dcuvirt-adapter-driver
//!
//! The boundary between the partition manager and the accelerator driver.
//!
//! This crate provides:
//! - The [`DeviceDriver`] trait: session handling, device enumeration, slice
//!   programming, mode changes and virtual-device lifecycle
//! - Backend selection from configuration
//! - An in-memory [`mock::MockDriver`] with failure injection
//!
//! Every call is synchronous. Driver failures are reported as [`DriverError`]
//! and converted into [`dcuvirt_core::Error`] at the manager boundary.

use thiserror::Error;

pub mod driver;

#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use driver::{create_driver, DeviceDriver, VDeviceSpec};

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors reported by a driver backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Driver backend not supported: {0}")]
    UnsupportedBackend(String),

    #[error("Operation not supported by driver: {0}")]
    NotSupported(String),

    #[error("Driver session not open: {0}")]
    SessionClosed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid driver argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Slices already programmed: {0}")]
    SliceConflict(String),

    #[error("Hardware resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Driver initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Driver communication error: {0}")]
    CommunicationError(String),
}

impl DriverError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Busy(_) | DriverError::CommunicationError(_)
        )
    }

    /// Check if this error indicates a permission issue
    pub fn is_permission_issue(&self) -> bool {
        matches!(self, DriverError::PermissionDenied(_))
    }
}

impl From<DriverError> for dcuvirt_core::Error {
    fn from(err: DriverError) -> Self {
        use dcuvirt_core::Error;

        match err {
            DriverError::UnsupportedBackend(msg) | DriverError::NotSupported(msg) => {
                Error::NotSupported(msg)
            }
            DriverError::SessionClosed(msg) => Error::Uninitialized(msg),
            DriverError::DeviceNotFound(msg) => Error::NotFound(msg),
            DriverError::InvalidArgument(msg) => Error::InvalidArgument(msg),
            DriverError::PermissionDenied(msg) => Error::NoPermission(msg),
            DriverError::Busy(msg) => Error::InUse(msg),
            DriverError::SliceConflict(msg) => Error::InsufficientResources(msg),
            DriverError::ResourceExhausted(msg) => Error::OutOfResources(msg),
            DriverError::InitializationFailed(msg) | DriverError::CommunicationError(msg) => {
                Error::Driver(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcuvirt_core::StatusCode;

    #[test]
    fn test_driver_error_properties() {
        let busy = DriverError::Busy("vdevice 2".to_string());
        assert!(busy.is_retryable());
        assert!(!busy.is_permission_issue());

        let perm = DriverError::PermissionDenied("/dev/mkfd".to_string());
        assert!(!perm.is_retryable());
        assert!(perm.is_permission_issue());
    }

    #[test]
    fn test_conversion_to_status() {
        let cases = [
            (DriverError::Busy("x".into()), StatusCode::InUse),
            (DriverError::SliceConflict("x".into()), StatusCode::InsufficientResources),
            (DriverError::ResourceExhausted("x".into()), StatusCode::OutOfResources),
            (DriverError::SessionClosed("x".into()), StatusCode::Uninitialized),
            (DriverError::CommunicationError("x".into()), StatusCode::Unknown),
            (DriverError::UnsupportedBackend("x".into()), StatusCode::NotSupported),
        ];

        for (err, status) in cases {
            let converted: dcuvirt_core::Error = err.into();
            assert_eq!(converted.status(), status);
        }
    }

    #[test]
    fn test_error_display() {
        let error = DriverError::UnsupportedBackend("kernel".to_string());
        assert_eq!(error.to_string(), "Driver backend not supported: kernel");
    }
}
