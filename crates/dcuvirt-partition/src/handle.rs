//! Caller-facing handles
//!
//! Handles are plain copyable keys. They carry the arena generation of the
//! record they were issued for, so a handle to a destroyed or reset instance
//! resolves to `NOT_FOUND` instead of aliasing a newer record.

use crate::arena::ArenaKey;
use dcuvirt_core::DeviceIndex;
use serde::{Deserialize, Serialize};

/// Handle to a GPU instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuInstanceHandle {
    pub(crate) device: DeviceIndex,
    pub(crate) key: ArenaKey,
}

impl GpuInstanceHandle {
    /// Device the instance was created on
    pub fn device(&self) -> DeviceIndex {
        self.device
    }
}

/// Handle to a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeInstanceHandle {
    pub(crate) gpu_instance: GpuInstanceHandle,
    pub(crate) key: ArenaKey,
}

impl ComputeInstanceHandle {
    /// Parent GPU instance
    pub fn gpu_instance(&self) -> GpuInstanceHandle {
        self.gpu_instance
    }

    pub fn device(&self) -> DeviceIndex {
        self.gpu_instance.device
    }
}

/// View of the compute instance currently listed at `index` on a device.
///
/// It is a lookup, not a resource: once the compute instance goes away the
/// handle is stale and must be re-resolved by index, which may then yield a
/// different compute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigDeviceHandle {
    pub(crate) index: u32,
    pub(crate) compute_instance: ComputeInstanceHandle,
}

impl MigDeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Physical device this MIG device lives on
    pub fn parent(&self) -> DeviceIndex {
        self.compute_instance.device()
    }

    pub fn compute_instance(&self) -> ComputeInstanceHandle {
        self.compute_instance
    }
}
