//! # dcuvirt-core
//!
//! Shared foundation for the dcuvirt accelerator partition manager.
//!
//! This crate provides:
//!
//! - The error taxonomy and the closed set of status codes
//! - Device identity, placement and mode types
//! - Layered configuration
//! - Logging initialization

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    Config, DriverBackend, DriverConfig, LoggingConfig, MockDeviceConfig, PartitionConfig,
};
pub use error::{Error, ErrorKind, Result, StatusCode};
pub use logging::init_logging;
pub use types::{
    ActivationStatus, ComputeInstanceId, DeviceAttributes, DeviceIndex, GpuInstanceId, MigMode,
    MigModeState, PciInfo, PhysicalDeviceInfo, Placement, ResourceQuota, VDeviceId,
    DEFAULT_MEMORY_SLICES, MAX_SLICES,
};
