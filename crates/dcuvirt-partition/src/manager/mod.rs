//! Device manager context
//!
//! [`DeviceManager`] owns one driver session and the partition state of every
//! enumerated device. Each device sits behind its own `RwLock`; mutating
//! operations hold the write lock across the occupancy check, the driver call
//! and the commit, so concurrent callers never both win the same slices.
//!
//! Lock order is the system mode lock first, then device locks in ascending
//! index order.

mod mig;
mod mode;
mod vdev;

pub use mig::{ComputeInstanceInfo, GpuInstanceInfo};
pub use vdev::RunningVDevice;

use crate::device::DeviceState;
use crate::stats::{ManagerStats, StatsSnapshot};
use dashmap::DashMap;
use dcuvirt_adapter_driver::{create_driver, DeviceDriver, DriverError};
use dcuvirt_core::{
    Config, DeviceAttributes, DeviceIndex, Error, MigMode, PartitionConfig, PciInfo,
    PhysicalDeviceInfo, Result, StatusCode, VDeviceId,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Partition manager for every device behind one driver session
pub struct DeviceManager {
    config: PartitionConfig,
    driver: Arc<dyn DeviceDriver>,
    infos: Vec<PhysicalDeviceInfo>,
    system_mode: RwLock<MigMode>,
    devices: Vec<RwLock<DeviceState>>,
    vdevice_owner: DashMap<VDeviceId, DeviceIndex>,
    next_vdevice_id: AtomicU32,
    initialized: AtomicBool,
    stats: ManagerStats,
}

impl DeviceManager {
    /// Open the driver session and enumerate devices
    pub fn new(config: PartitionConfig, driver: Arc<dyn DeviceDriver>) -> Result<Self> {
        config.validate()?;
        driver.open()?;

        let mut infos = match driver.enumerate_devices() {
            Ok(infos) => infos,
            Err(err) => {
                if let Err(close_err) = driver.close() {
                    warn!("Failed to close driver after enumeration error: {}", close_err);
                }
                return Err(err.into());
            }
        };
        infos.sort_by_key(|info| info.index);

        let devices = match Self::build_devices(&infos, config.max_vdevices_per_device) {
            Ok(devices) => devices,
            Err(err) => {
                if let Err(close_err) = driver.close() {
                    warn!("Failed to close driver after enumeration error: {}", close_err);
                }
                return Err(err);
            }
        };

        let mut system_mode = config.system_mig_mode;
        if system_mode.is_enabled() && !infos.iter().any(|info| info.mig_capable) {
            warn!("No MIG-capable device found; system MIG mode stays disabled");
            system_mode = MigMode::Disabled;
        }

        info!(
            "Device manager initialized: {} devices, system MIG mode {}",
            infos.len(),
            system_mode
        );

        Ok(Self {
            config,
            driver,
            infos,
            system_mode: RwLock::new(system_mode),
            devices,
            vdevice_owner: DashMap::new(),
            next_vdevice_id: AtomicU32::new(0),
            initialized: AtomicBool::new(true),
            stats: ManagerStats::default(),
        })
    }

    /// Build the configured driver backend and open a manager on it
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let driver = create_driver(&config.driver)?;
        Self::new(config.partition.clone(), driver)
    }

    fn build_devices(
        infos: &[PhysicalDeviceInfo],
        max_vdevices: u32,
    ) -> Result<Vec<RwLock<DeviceState>>> {
        infos
            .iter()
            .enumerate()
            .map(|(position, info)| {
                if info.index.get() as usize != position {
                    return Err(Error::driver(format!(
                        "driver enumerated device index {} at position {}",
                        info.index, position
                    )));
                }
                Ok(RwLock::new(DeviceState::new(info, max_vdevices)?))
            })
            .collect()
    }

    /// Stop outstanding virtual-device starts and close the driver session.
    ///
    /// Every later call fails with `UNINITIALIZED`.
    pub fn shutdown(&self) -> Result<()> {
        let _system = self.system_mode.write();
        let mut guards: Vec<_> = self.devices.iter().map(|device| device.write()).collect();

        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Err(Error::uninitialized("device manager already shut down"));
        }

        info!("Shutting down device manager");
        teardown(
            self.driver.as_ref(),
            guards.iter_mut().map(|guard| &mut **guard),
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of physical devices
    pub fn device_count(&self) -> Result<u32> {
        self.ensure_initialized()?;
        Ok(self.infos.len() as u32)
    }

    /// Device at a position in enumeration order
    pub fn device_handle_by_index(&self, index: u32) -> Result<DeviceIndex> {
        self.ensure_initialized()?;
        self.info(DeviceIndex(index)).map(|info| info.index)
    }

    pub fn device_handle_by_uuid(&self, uuid: &str) -> Result<DeviceIndex> {
        self.find_device(|info| info.uuid == uuid, || format!("device with UUID {}", uuid))
    }

    pub fn device_handle_by_serial(&self, serial: &str) -> Result<DeviceIndex> {
        self.find_device(
            |info| info.serial == serial,
            || format!("device with serial {}", serial),
        )
    }

    pub fn device_handle_by_pci_bus_id(&self, bus_id: &str) -> Result<DeviceIndex> {
        self.find_device(
            |info| info.pci.matches_bus_id(bus_id),
            || format!("device at PCI bus id {}", bus_id),
        )
    }

    /// Static identity and capacity of a device
    pub fn device_info(&self, device: DeviceIndex) -> Result<PhysicalDeviceInfo> {
        self.ensure_initialized()?;
        self.info(device).cloned()
    }

    pub fn device_name(&self, device: DeviceIndex) -> Result<String> {
        Ok(self.device_info(device)?.name)
    }

    pub fn device_uuid(&self, device: DeviceIndex) -> Result<String> {
        Ok(self.device_info(device)?.uuid)
    }

    pub fn device_serial(&self, device: DeviceIndex) -> Result<String> {
        Ok(self.device_info(device)?.serial)
    }

    pub fn device_pci_info(&self, device: DeviceIndex) -> Result<PciInfo> {
        Ok(self.device_info(device)?.pci)
    }

    /// Attributes of a whole physical device; slice counts are zero
    pub fn device_attributes(&self, device: DeviceIndex) -> Result<DeviceAttributes> {
        let info = self.device_info(device)?;
        Ok(DeviceAttributes {
            index: info.index.get(),
            compute_units: info.compute_units,
            memory_mb: info.memory_mb,
            uuid: info.uuid,
            name: info.name,
            gpu_instance_slice_count: 0,
            compute_instance_slice_count: 0,
        })
    }

    pub fn device_busy_percent(&self, device: DeviceIndex) -> Result<u32> {
        self.ensure_initialized()?;
        self.info(device)?;
        self.driver_call(self.driver.device_busy_percent(device))
    }

    fn find_device<P, M>(&self, predicate: P, describe: M) -> Result<DeviceIndex>
    where
        P: Fn(&PhysicalDeviceInfo) -> bool,
        M: FnOnce() -> String,
    {
        self.ensure_initialized()?;
        self.infos
            .iter()
            .find(|info| predicate(info))
            .map(|info| info.index)
            .ok_or_else(|| Error::not_found(describe()))
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::uninitialized("device manager is shut down"));
        }
        Ok(())
    }

    fn info(&self, device: DeviceIndex) -> Result<&PhysicalDeviceInfo> {
        self.infos
            .get(device.get() as usize)
            .ok_or_else(|| Error::invalid_argument(format!("no device {}", device)))
    }

    fn slot(&self, device: DeviceIndex) -> Result<&RwLock<DeviceState>> {
        self.devices
            .get(device.get() as usize)
            .ok_or_else(|| Error::invalid_argument(format!("no device {}", device)))
    }

    fn read_device(&self, device: DeviceIndex) -> Result<RwLockReadGuard<'_, DeviceState>> {
        let guard = self.slot(device)?.read();
        self.ensure_initialized()?;
        Ok(guard)
    }

    fn write_device(&self, device: DeviceIndex) -> Result<RwLockWriteGuard<'_, DeviceState>> {
        let guard = self.slot(device)?.write();
        self.ensure_initialized()?;
        Ok(guard)
    }

    /// Convert a driver result, counting failures
    fn driver_call<T>(&self, result: std::result::Result<T, DriverError>) -> Result<T> {
        result.map_err(|err| {
            ManagerStats::bump(&self.stats.driver_failures, 1);
            debug!("Driver call failed: {}", err);
            Error::from(err)
        })
    }

    /// Account for a rejected mutation
    fn reject<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            ManagerStats::bump(&self.stats.rejected_mutations, 1);
            if err.status() == StatusCode::InsufficientResources {
                ManagerStats::bump(&self.stats.placement_conflicts, 1);
            }
            warn!("{} rejected: {} ({})", operation, err, err.status());
        }
        result
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        debug!("Device manager dropped without shutdown; tearing down");
        let driver = Arc::clone(&self.driver);
        let states = self.devices.iter_mut().map(|device| device.get_mut());
        if let Err(err) = teardown(driver.as_ref(), states) {
            warn!("Device manager teardown on drop failed: {}", err);
        }
    }
}

/// Stop every start made through the context, then close the session
fn teardown<'a, I>(driver: &dyn DeviceDriver, states: I) -> Result<()>
where
    I: Iterator<Item = &'a mut DeviceState>,
{
    for state in states {
        let device = state.vdevices.device();
        for (id, starts) in state.vdevices.running() {
            match driver.stop_vdevice(device, id) {
                Ok(()) => debug!("Stopped vdevice {} ({} outstanding starts)", id, starts),
                Err(err) => warn!("Failed to stop vdevice {} during teardown: {}", id, err),
            }
            state.vdevices.set_starts(id, 0)?;
        }
    }

    driver.close()?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use dcuvirt_adapter_driver::mock::{MockDriver, MockOp};

    #[test]
    fn test_manager_opens_session() {
        let (manager, driver) = manager(2);
        assert!(driver.is_open());
        assert!(manager.is_initialized());
        assert_eq!(manager.device_count().unwrap(), 2);
        assert_eq!(manager.system_mig_mode().unwrap(), MigMode::Enabled);
    }

    #[test]
    fn test_from_config() {
        let manager = DeviceManager::from_config(&Config::default()).unwrap();
        assert_eq!(manager.device_count().unwrap(), 2);
        manager.shutdown().unwrap();
    }

    #[test]
    fn test_device_lookups() {
        let (manager, _) = manager(2);
        let info = manager.device_info(DeviceIndex(1)).unwrap();

        assert_eq!(manager.device_handle_by_index(1).unwrap(), DeviceIndex(1));
        assert_eq!(manager.device_handle_by_uuid(&info.uuid).unwrap(), DeviceIndex(1));
        assert_eq!(manager.device_handle_by_serial(&info.serial).unwrap(), DeviceIndex(1));
        assert_eq!(
            manager
                .device_handle_by_pci_bus_id(&info.pci.bus_id.to_uppercase())
                .unwrap(),
            DeviceIndex(1)
        );

        assert_eq!(
            manager.device_handle_by_index(2).unwrap_err().status(),
            StatusCode::InvalidArgument
        );
        assert_eq!(
            manager.device_handle_by_uuid("GPU-missing").unwrap_err().status(),
            StatusCode::NotFound
        );
    }

    #[test]
    fn test_device_attributes() {
        let (manager, _) = manager(1);
        let attrs = manager.device_attributes(DeviceIndex(0)).unwrap();
        assert_eq!(attrs.compute_units, 8);
        assert_eq!(attrs.memory_mb, 2048);
        assert_eq!(attrs.gpu_instance_slice_count, 0);
        assert_eq!(manager.device_name(DeviceIndex(0)).unwrap(), "Mock DCU 0");
    }

    #[test]
    fn test_busy_percent_passthrough() {
        let (manager, driver) = manager(1);
        driver.set_device_busy_percent(DeviceIndex(0), 42);
        assert_eq!(manager.device_busy_percent(DeviceIndex(0)).unwrap(), 42);
    }

    #[test]
    fn test_shutdown_makes_calls_uninitialized() {
        let (manager, driver) = manager(1);
        manager.shutdown().unwrap();

        assert!(!driver.is_open());
        assert_eq!(manager.device_count().unwrap_err().status(), StatusCode::Uninitialized);
        assert_eq!(
            manager
                .set_mig_mode(DeviceIndex(0), MigMode::Enabled)
                .unwrap_err()
                .status(),
            StatusCode::Uninitialized
        );
        assert_eq!(manager.shutdown().unwrap_err().status(), StatusCode::Uninitialized);
    }

    #[test]
    fn test_drop_closes_session() {
        let (manager, driver) = manager(1);
        drop(manager);
        assert!(!driver.is_open());
        assert_eq!(driver.call_count(MockOp::Close), 1);
    }

    #[test]
    fn test_enumeration_failure_closes_session() {
        let driver = Arc::new(MockDriver::new(vec![MockDriver::device_info(0, 8, 2048, 8)]));
        driver.fail_next(
            MockOp::Enumerate,
            DriverError::CommunicationError("no response".to_string()),
        );

        let result = DeviceManager::new(PartitionConfig::default(), driver.clone());
        assert_eq!(result.err().map(|e| e.status()), Some(StatusCode::Unknown));
        assert!(!driver.is_open());
    }

    #[test]
    fn test_non_contiguous_indices_rejected() {
        let driver = Arc::new(MockDriver::new(vec![MockDriver::device_info(3, 8, 2048, 8)]));
        let result = DeviceManager::new(PartitionConfig::default(), driver.clone());
        assert!(result.is_err());
        assert!(!driver.is_open());
    }

    #[test]
    fn test_system_mode_disabled_without_capable_devices() {
        let mut info = MockDriver::device_info(0, 8, 2048, 8);
        info.mig_capable = false;
        let (manager, _) = manager_with(vec![info]);
        assert_eq!(manager.system_mig_mode().unwrap(), MigMode::Disabled);
    }
}
