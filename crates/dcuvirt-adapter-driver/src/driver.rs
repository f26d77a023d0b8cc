//! Driver trait and backend selection

use crate::{DriverError, Result};
use dcuvirt_core::{
    ActivationStatus, ComputeInstanceId, DeviceIndex, DriverBackend, DriverConfig,
    GpuInstanceId, MigMode, PhysicalDeviceInfo, Placement, ResourceQuota, VDeviceId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// One virtual device to be created in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDeviceSpec {
    pub id: VDeviceId,
    pub quota: ResourceQuota,
}

/// Operations the partition manager needs from the accelerator driver.
///
/// The manager serializes calls per device and only invokes a mutating
/// operation after its own occupancy check has passed; the driver remains the
/// authority across processes and may still refuse.
pub trait DeviceDriver: Send + Sync {
    /// Backend that implements this driver
    fn backend(&self) -> DriverBackend;

    /// Open the driver session
    fn open(&self) -> Result<()>;

    /// Close the driver session
    fn close(&self) -> Result<()>;

    /// Check whether the session is open
    fn is_open(&self) -> bool;

    /// Enumerate physical devices and their static attributes
    fn enumerate_devices(&self) -> Result<Vec<PhysicalDeviceInfo>>;

    /// Program the memory slices of a new GPU instance
    fn program_gpu_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        placement: Placement,
    ) -> Result<()>;

    /// Release the memory slices of a GPU instance
    fn release_gpu_instance(&self, device: DeviceIndex, gpu_instance: GpuInstanceId)
        -> Result<()>;

    /// Program the compute slices of a new compute instance
    fn program_compute_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
        placement: Placement,
    ) -> Result<()>;

    /// Release the compute slices of a compute instance
    fn release_compute_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<()>;

    /// Whether a workload is still attached to a GPU instance, or to one of its
    /// compute instances when `compute_instance` is given
    fn instance_in_use(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: Option<ComputeInstanceId>,
    ) -> Result<bool>;

    /// Request a MIG mode change on a device
    fn set_mig_mode(&self, device: DeviceIndex, mode: MigMode) -> Result<ActivationStatus>;

    /// Reset a device, dropping every slice it has programmed
    fn reset_device(&self, device: DeviceIndex) -> Result<()>;

    /// Create a batch of virtual devices; all or nothing
    fn create_vdevices(&self, device: DeviceIndex, specs: &[VDeviceSpec]) -> Result<()>;

    /// Change the quota of a stopped virtual device
    fn update_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId, quota: ResourceQuota)
        -> Result<()>;

    /// Destroy a stopped virtual device
    fn destroy_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()>;

    /// Start a virtual device
    fn start_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()>;

    /// Stop a virtual device
    fn stop_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()>;

    /// Busy percent of a physical device
    fn device_busy_percent(&self, device: DeviceIndex) -> Result<u32>;

    /// Busy percent of a virtual device
    fn vdevice_busy_percent(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<u32>;
}

/// Create the driver selected by configuration
pub fn create_driver(config: &DriverConfig) -> Result<Arc<dyn DeviceDriver>> {
    info!("Creating device driver for backend: {:?}", config.backend);

    match config.backend {
        #[cfg(any(feature = "mock", test))]
        DriverBackend::Mock => {
            let driver = crate::mock::MockDriver::from_config(config)?;
            Ok(Arc::new(driver))
        }

        backend => {
            warn!(
                "Driver backend {:?} is not available in this build (device node {})",
                backend,
                config.device_node.display()
            );
            Err(DriverError::UnsupportedBackend(format!("{:?}", backend)))
        }
    }
}
