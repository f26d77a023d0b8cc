//! # dcuvirt-partition
//!
//! Partitioning of accelerator devices into isolated sub-devices.
//!
//! This crate provides:
//! - A slice occupancy map with first-fit placement and capacity queries
//! - The GPU instance / compute instance profile catalog
//! - A generation-checked instance registry with rollback on driver failure
//! - MIG mode arbitration at device and system level
//! - The legacy quota-based virtual-device table
//! - [`DeviceManager`], the context that ties them to a [`DeviceDriver`](dcuvirt_adapter_driver::DeviceDriver)
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dcuvirt_adapter_driver::mock::MockDriver;
//! use dcuvirt_core::{DeviceIndex, MigMode, PartitionConfig};
//! use dcuvirt_partition::{DeviceManager, GPU_INSTANCE_PROFILE_4_SLICE};
//!
//! let driver = Arc::new(MockDriver::new(vec![MockDriver::device_info(0, 64, 32768, 8)]));
//! let manager = DeviceManager::new(PartitionConfig::default(), driver)?;
//!
//! let device = manager.device_handle_by_index(0)?;
//! manager.set_mig_mode(device, MigMode::Enabled)?;
//!
//! let gi = manager.create_gpu_instance(device, GPU_INSTANCE_PROFILE_4_SLICE)?;
//! println!("{:?}", manager.gpu_instance_info(gi)?);
//! assert_eq!(manager.gpu_instance_remaining_capacity(DeviceIndex(0), GPU_INSTANCE_PROFILE_4_SLICE)?, 1);
//!
//! manager.shutdown()?;
//! # Ok::<(), dcuvirt_core::Error>(())
//! ```

pub mod arena;
pub mod catalog;
mod device;
pub mod handle;
pub mod manager;
pub mod mode;
pub mod occupancy;
pub mod placement;
pub mod registry;
pub mod stats;
pub mod vdevice;

pub use catalog::{
    ComputeInstanceProfileInfo, GpuInstanceProfileInfo, COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT,
    COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED, COMPUTE_INSTANCE_PROFILE_1_SLICE,
    COMPUTE_INSTANCE_PROFILE_2_SLICE, COMPUTE_INSTANCE_PROFILE_3_SLICE,
    COMPUTE_INSTANCE_PROFILE_4_SLICE, COMPUTE_INSTANCE_PROFILE_COUNT,
    GPU_INSTANCE_PROFILE_1_SLICE, GPU_INSTANCE_PROFILE_2_SLICE, GPU_INSTANCE_PROFILE_3_SLICE,
    GPU_INSTANCE_PROFILE_4_SLICE, GPU_INSTANCE_PROFILE_COUNT,
};
pub use handle::{ComputeInstanceHandle, GpuInstanceHandle, MigDeviceHandle};
pub use manager::{ComputeInstanceInfo, DeviceManager, GpuInstanceInfo, RunningVDevice};
pub use occupancy::SliceOccupancy;
pub use stats::{ManagerStats, StatsSnapshot};
pub use vdevice::{QuotaUpdate, VDeviceInfo};
