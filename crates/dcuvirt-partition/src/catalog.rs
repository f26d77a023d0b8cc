//! Profile catalog
//!
//! Profiles are derived from the device shape: a GPU instance profile of `n`
//! slices gets `n/total` of the device's compute units and memory, and a
//! compute instance profile of `k` slices gets `k/n` of its parent's compute
//! units.

use dcuvirt_core::{Error, PhysicalDeviceInfo, Result};
use serde::{Deserialize, Serialize};

/// GPU instance profile IDs
pub const GPU_INSTANCE_PROFILE_1_SLICE: u32 = 0;
pub const GPU_INSTANCE_PROFILE_2_SLICE: u32 = 1;
pub const GPU_INSTANCE_PROFILE_3_SLICE: u32 = 2;
pub const GPU_INSTANCE_PROFILE_4_SLICE: u32 = 3;
pub const GPU_INSTANCE_PROFILE_COUNT: u32 = 4;

/// Compute instance profile IDs
pub const COMPUTE_INSTANCE_PROFILE_1_SLICE: u32 = 0;
pub const COMPUTE_INSTANCE_PROFILE_2_SLICE: u32 = 1;
pub const COMPUTE_INSTANCE_PROFILE_3_SLICE: u32 = 2;
pub const COMPUTE_INSTANCE_PROFILE_4_SLICE: u32 = 3;
pub const COMPUTE_INSTANCE_PROFILE_COUNT: u32 = 4;

/// Compute instance engine profiles; engines are always shared
pub const COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED: u32 = 0;
pub const COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT: u32 = 1;

/// Shape of a GPU instance profile on a particular device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInstanceProfileInfo {
    pub id: u32,
    /// Most instances of this profile the device can hold at once
    pub max_count: u32,
    pub compute_units: u32,
    pub slice_count: u32,
    pub memory_mb: u64,
    pub name: String,
}

/// Shape of a compute instance profile inside a particular GPU instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstanceProfileInfo {
    pub id: u32,
    /// Most instances of this profile the parent can hold at once
    pub max_count: u32,
    pub compute_units: u32,
    pub slice_count: u32,
    pub name: String,
}

/// Slice count of a GPU or compute instance profile
pub fn profile_slice_count(profile_id: u32) -> Result<u32> {
    if profile_id >= GPU_INSTANCE_PROFILE_COUNT {
        return Err(Error::invalid_argument(format!(
            "unknown profile {}",
            profile_id
        )));
    }
    Ok(profile_id + 1)
}

/// Resolve a GPU instance profile against a device
pub fn gpu_instance_profile(
    device: &PhysicalDeviceInfo,
    profile_id: u32,
) -> Result<GpuInstanceProfileInfo> {
    let slices = profile_slice_count(profile_id)?;
    let total = device.memory_slices;

    if !device.mig_capable || slices > total {
        return Err(Error::not_supported(format!(
            "gpu instance profile {} on device {}",
            profile_id, device.index
        )));
    }

    let memory_mb = device.memory_mb * slices as u64 / total as u64;
    Ok(GpuInstanceProfileInfo {
        id: profile_id,
        max_count: total / slices,
        compute_units: device.compute_units * slices / total,
        slice_count: slices,
        memory_mb,
        name: profile_name(slices, memory_mb),
    })
}

/// `<slices>g.<memory>gb`, rounded to the nearest GiB, or `<memory>mb` below one GiB
fn profile_name(slices: u32, memory_mb: u64) -> String {
    if memory_mb < 1024 {
        format!("{}g.{}mb", slices, memory_mb)
    } else {
        format!("{}g.{}gb", slices, (memory_mb + 512) / 1024)
    }
}

/// Resolve a compute instance profile against its parent GPU instance profile
pub fn compute_instance_profile(
    parent: &GpuInstanceProfileInfo,
    profile_id: u32,
    engine_profile_id: u32,
) -> Result<ComputeInstanceProfileInfo> {
    let slices = profile_slice_count(profile_id)?;

    if engine_profile_id >= COMPUTE_INSTANCE_ENGINE_PROFILE_COUNT {
        return Err(Error::invalid_argument(format!(
            "unknown engine profile {}",
            engine_profile_id
        )));
    }

    if slices > parent.slice_count {
        return Err(Error::not_supported(format!(
            "compute instance profile {} in {}",
            profile_id, parent.name
        )));
    }

    Ok(ComputeInstanceProfileInfo {
        id: profile_id,
        max_count: parent.slice_count / slices,
        compute_units: parent.compute_units * slices / parent.slice_count,
        slice_count: slices,
        name: format!("{}c.{}", slices, parent.name),
    })
}
