//! Error handling for dcuvirt
//!
//! Every fallible operation returns [`Result`]. Each [`Error`] maps onto exactly
//! one [`StatusCode`] from a closed set, so callers that speak in status codes
//! (CLI tooling, telemetry exporters) never have to inspect message strings.

use std::fmt;

/// Result type alias for dcuvirt operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for dcuvirt
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The manager context was shut down or never initialized
    #[error("Uninitialized: {0}")]
    Uninitialized(String),

    /// A supplied argument is invalid
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not available on the target device or in its current mode
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The caller lacks permission for the operation
    #[error("No permission: {0}")]
    NoPermission(String),

    /// A handle or ID did not resolve
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource still has children or attached workloads
    #[error("In use: {0}")]
    InUse(String),

    /// No conflict-free placement exists
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// A caller-supplied buffer is too small
    #[error("Insufficient size: {0}")]
    InsufficientSize(String),

    /// Requested quotas exceed what the device has left
    #[error("Out of resources: {0}")]
    OutOfResources(String),

    /// The device class lacks virtualization support
    #[error("Device not supported: {0}")]
    DeviceNotSupported(String),

    /// The virtual device is running
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// The virtual device does not exist
    #[error("Virtual device does not exist: {0}")]
    VDeviceNotExist(String),

    /// The driver reported a failure this layer cannot classify
    #[error("Driver error: {0}")]
    Driver(String),

    /// Anything else
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Closed set of status codes exposed to callers.
///
/// The numeric values are stable. MIG statuses use the NVML-compatible numbering
/// and the virtual-device statuses keep their legacy DMI values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    Uninitialized = 1,
    InvalidArgument = 2,
    NotSupported = 3,
    NoPermission = 4,
    NotFound = 6,
    InsufficientSize = 7,
    InUse = 19,
    InsufficientResources = 23,
    OutOfResources = 11,
    DeviceNotSupported = 14,
    VDeviceNotExist = 15,
    DeviceBusy = 17,
    Unknown = 999,
}

/// Coarse classification used for retry decisions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller error or capability mismatch, rejected before any mutation
    Precondition,
    /// Another owner holds the resource
    Contention,
    /// No placement or quota is left
    Exhaustion,
    /// Handle or ID does not resolve in the current snapshot
    Lookup,
    /// Driver-layer or unexpected failure
    Internal,
}

impl StatusCode {
    pub const ALL: [StatusCode; 14] = [
        StatusCode::Success,
        StatusCode::Uninitialized,
        StatusCode::InvalidArgument,
        StatusCode::NotSupported,
        StatusCode::NoPermission,
        StatusCode::NotFound,
        StatusCode::InsufficientSize,
        StatusCode::InUse,
        StatusCode::InsufficientResources,
        StatusCode::OutOfResources,
        StatusCode::DeviceNotSupported,
        StatusCode::VDeviceNotExist,
        StatusCode::DeviceBusy,
        StatusCode::Unknown,
    ];

    /// Numeric value of the status
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human-readable description of the status
    pub fn description(self) -> &'static str {
        match self {
            StatusCode::Success => "The operation was successful",
            StatusCode::Uninitialized => "The device manager was not initialized",
            StatusCode::InvalidArgument => "A supplied argument is invalid",
            StatusCode::NotSupported => {
                "The requested operation is not available on target device"
            }
            StatusCode::NoPermission => {
                "The current user does not have permission for operation"
            }
            StatusCode::NotFound => "A query to find an object was unsuccessful",
            StatusCode::InsufficientSize => "An input argument is not large enough",
            StatusCode::InUse => {
                "An operation cannot be performed because the resource is in use"
            }
            StatusCode::InsufficientResources => "Ran out of critical resources",
            StatusCode::OutOfResources => "The required resources exceed the hardware limit",
            StatusCode::DeviceNotSupported => "The current device is not supported",
            StatusCode::VDeviceNotExist => "The virtual device does not exist",
            StatusCode::DeviceBusy => "Device busy",
            StatusCode::Unknown => "An unknown error occurred",
        }
    }

    /// Check if this status denotes success
    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::Uninitialized => "UNINITIALIZED",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotSupported => "NOT_SUPPORTED",
            StatusCode::NoPermission => "NO_PERMISSION",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::InsufficientSize => "INSUFFICIENT_SIZE",
            StatusCode::InUse => "IN_USE",
            StatusCode::InsufficientResources => "INSUFFICIENT_RESOURCES",
            StatusCode::OutOfResources => "OUT_OF_RESOURCES",
            StatusCode::DeviceNotSupported => "DEVICE_NOT_SUPPORT",
            StatusCode::VDeviceNotExist => "VDEV_NOT_EXIST",
            StatusCode::DeviceBusy => "DEVICE_BUSY",
            StatusCode::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<u32> for StatusCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        StatusCode::ALL
            .iter()
            .copied()
            .find(|status| status.code() == value)
            .ok_or_else(|| Error::invalid_argument(format!("unknown status code {}", value)))
    }
}

impl Error {
    /// Create an uninitialized error
    pub fn uninitialized(msg: impl Into<String>) -> Self {
        Self::Uninitialized(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create a no permission error
    pub fn no_permission(msg: impl Into<String>) -> Self {
        Self::NoPermission(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an in use error
    pub fn in_use(msg: impl Into<String>) -> Self {
        Self::InUse(msg.into())
    }

    /// Create an insufficient resources error
    pub fn insufficient_resources(msg: impl Into<String>) -> Self {
        Self::InsufficientResources(msg.into())
    }

    /// Create an insufficient size error
    pub fn insufficient_size(msg: impl Into<String>) -> Self {
        Self::InsufficientSize(msg.into())
    }

    /// Create an out of resources error
    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        Self::OutOfResources(msg.into())
    }

    /// Create a device not supported error
    pub fn device_not_supported(msg: impl Into<String>) -> Self {
        Self::DeviceNotSupported(msg.into())
    }

    /// Create a device busy error
    pub fn device_busy(msg: impl Into<String>) -> Self {
        Self::DeviceBusy(msg.into())
    }

    /// Create a virtual device not exist error
    pub fn vdevice_not_exist(msg: impl Into<String>) -> Self {
        Self::VDeviceNotExist(msg.into())
    }

    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create an unknown error
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Status code reported to callers
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Uninitialized(_) => StatusCode::Uninitialized,
            Error::InvalidArgument(_) => StatusCode::InvalidArgument,
            Error::NotSupported(_) => StatusCode::NotSupported,
            Error::NoPermission(_) => StatusCode::NoPermission,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InUse(_) => StatusCode::InUse,
            Error::InsufficientResources(_) => StatusCode::InsufficientResources,
            Error::InsufficientSize(_) => StatusCode::InsufficientSize,
            Error::OutOfResources(_) => StatusCode::OutOfResources,
            Error::DeviceNotSupported(_) => StatusCode::DeviceNotSupported,
            Error::DeviceBusy(_) => StatusCode::DeviceBusy,
            Error::VDeviceNotExist(_) => StatusCode::VDeviceNotExist,
            Error::InvalidConfiguration(_)
            | Error::Json(_)
            | Error::Yaml(_)
            | Error::Config(_) => StatusCode::InvalidArgument,
            Error::Driver(_) | Error::Unknown(_) | Error::Io(_) => StatusCode::Unknown,
        }
    }

    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self.status() {
            StatusCode::Uninitialized
            | StatusCode::InvalidArgument
            | StatusCode::NotSupported
            | StatusCode::NoPermission
            | StatusCode::DeviceNotSupported => ErrorKind::Precondition,
            StatusCode::InUse | StatusCode::DeviceBusy => ErrorKind::Contention,
            StatusCode::InsufficientResources
            | StatusCode::InsufficientSize
            | StatusCode::OutOfResources => ErrorKind::Exhaustion,
            StatusCode::NotFound | StatusCode::VDeviceNotExist => ErrorKind::Lookup,
            StatusCode::Success | StatusCode::Unknown => ErrorKind::Internal,
        }
    }

    /// Check if the caller may retry after quiescing the owner of the resource
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }

    /// Check if this error indicates a caller-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Precondition | ErrorKind::Lookup
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Uninitialized(_) => "uninitialized",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotSupported(_) => "not_supported",
            Error::NoPermission(_) => "no_permission",
            Error::NotFound(_) => "not_found",
            Error::InUse(_) => "in_use",
            Error::InsufficientResources(_) => "insufficient_resources",
            Error::InsufficientSize(_) => "insufficient_size",
            Error::OutOfResources(_) => "out_of_resources",
            Error::DeviceNotSupported(_) => "device_not_supported",
            Error::DeviceBusy(_) => "device_busy",
            Error::VDeviceNotExist(_) => "vdevice_not_exist",
            Error::Driver(_) => "driver",
            Error::Unknown(_) => "unknown",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
        }
    }
}
