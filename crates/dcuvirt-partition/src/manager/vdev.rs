//! Legacy virtual-device operations

use super::DeviceManager;
use crate::stats::ManagerStats;
use crate::vdevice::{QuotaUpdate, VDeviceInfo, VDeviceTable};
use dcuvirt_adapter_driver::VDeviceSpec;
use dcuvirt_core::{DeviceIndex, Error, ResourceQuota, Result, VDeviceId};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// A virtual device started through [`DeviceManager::start_vdevice_scoped`].
///
/// Dropping the guard releases its start.
#[must_use = "dropping the guard stops the virtual device"]
pub struct RunningVDevice<'a> {
    manager: &'a DeviceManager,
    id: VDeviceId,
    stopped: bool,
}

impl RunningVDevice<'_> {
    pub fn id(&self) -> VDeviceId {
        self.id
    }

    /// Release the start now and report the outcome
    pub fn stop(mut self) -> Result<()> {
        self.stopped = true;
        self.manager.stop_vdevice(self.id)
    }
}

impl Drop for RunningVDevice<'_> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        if let Err(err) = self.manager.stop_vdevice(self.id) {
            warn!("Failed to stop vdevice {} on guard drop: {}", self.id, err);
        }
    }
}

impl DeviceManager {
    /// Create a batch of virtual devices, all or nothing
    pub fn create_vdevices(
        &self,
        device: DeviceIndex,
        count: u32,
        compute_units: &[u32],
        memory_mb: &[u64],
    ) -> Result<Vec<VDeviceId>> {
        let result = self.create_vdevices_inner(device, count, compute_units, memory_mb);
        self.reject("create_vdevices", result)
    }

    fn create_vdevices_inner(
        &self,
        device: DeviceIndex,
        count: u32,
        compute_units: &[u32],
        memory_mb: &[u64],
    ) -> Result<Vec<VDeviceId>> {
        if compute_units.len() != count as usize || memory_mb.len() != count as usize {
            return Err(Error::invalid_argument(format!(
                "expected {} quotas, got {} compute unit and {} memory entries",
                count,
                compute_units.len(),
                memory_mb.len()
            )));
        }

        let mut state = self.write_device(device)?;
        let info = self.info(device)?;

        if !info.virtualization_capable {
            return Err(Error::device_not_supported(format!(
                "device {} has no virtualization support",
                device
            )));
        }
        if state.mode.current.is_enabled() || state.mode.pending.is_enabled() {
            return Err(Error::not_supported(format!(
                "device {} is in MIG mode",
                device
            )));
        }

        let quotas: Vec<ResourceQuota> = compute_units
            .iter()
            .zip(memory_mb)
            .map(|(cu, mem)| ResourceQuota::new(*cu, *mem))
            .collect();
        state.vdevices.check_create(&quotas)?;

        let first = self.next_vdevice_id.fetch_add(count, Ordering::SeqCst);
        let specs: Vec<VDeviceSpec> = quotas
            .into_iter()
            .zip(first..)
            .map(|(quota, id)| VDeviceSpec {
                id: VDeviceId(id),
                quota,
            })
            .collect();

        if let Err(err) = self.driver_call(self.driver.create_vdevices(device, &specs)) {
            // hand the IDs back unless another create has claimed past them
            let _ = self.next_vdevice_id.compare_exchange(
                first.wrapping_add(count),
                first,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return Err(err);
        }

        for spec in &specs {
            state.vdevices.insert(spec.id, spec.quota);
            self.vdevice_owner.insert(spec.id, device);
        }

        ManagerStats::bump(&self.stats.vdevices_created, specs.len() as u64);
        info!("Created {} vdevices on device {}", specs.len(), device);
        Ok(specs.into_iter().map(|spec| spec.id).collect())
    }

    /// Destroy one stopped virtual device
    pub fn destroy_single_vdevice(&self, id: VDeviceId) -> Result<()> {
        let result = self.destroy_single_vdevice_inner(id);
        self.reject("destroy_single_vdevice", result)
    }

    fn destroy_single_vdevice_inner(&self, id: VDeviceId) -> Result<()> {
        let device = self.vdevice_device(id)?;
        let mut state = self.write_device(device)?;
        state.vdevices.check_destroy(id)?;

        self.driver_call(self.driver.destroy_vdevice(device, id))?;
        state.vdevices.remove(id)?;
        self.vdevice_owner.remove(&id);

        ManagerStats::bump(&self.stats.vdevices_destroyed, 1);
        info!("Destroyed vdevice {} on device {}", id, device);
        Ok(())
    }

    /// Destroy every virtual device of a device, all or nothing
    pub fn destroy_vdevices(&self, device: DeviceIndex) -> Result<()> {
        let result = self.destroy_vdevices_inner(device);
        self.reject("destroy_vdevices", result)
    }

    fn destroy_vdevices_inner(&self, device: DeviceIndex) -> Result<()> {
        let mut state = self.write_device(device)?;
        let ids = state.vdevices.ids();

        if ids.is_empty() {
            return Err(Error::vdevice_not_exist(format!(
                "device {} has no vdevices",
                device
            )));
        }
        if state.vdevices.any_running() {
            return Err(Error::not_supported(format!(
                "device {} has running vdevices",
                device
            )));
        }

        let mut destroyed = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Err(err) = self.driver_call(self.driver.destroy_vdevice(device, *id)) {
                self.recreate_vdevices(device, &state.vdevices, &destroyed);
                return Err(err);
            }
            destroyed.push(*id);
        }

        for id in &ids {
            state.vdevices.remove(*id)?;
            self.vdevice_owner.remove(id);
        }

        ManagerStats::bump(&self.stats.vdevices_destroyed, ids.len() as u64);
        info!("Destroyed {} vdevices on device {}", ids.len(), device);
        Ok(())
    }

    /// Put back vdevices a failed batch destroy already removed from the driver
    fn recreate_vdevices(&self, device: DeviceIndex, table: &VDeviceTable, ids: &[VDeviceId]) {
        if ids.is_empty() {
            return;
        }

        let specs: Result<Vec<VDeviceSpec>> = ids
            .iter()
            .map(|id| {
                Ok(VDeviceSpec {
                    id: *id,
                    quota: table.quota(*id)?,
                })
            })
            .collect();

        let outcome = specs.and_then(|specs| {
            self.driver_call(self.driver.create_vdevices(device, &specs))
        });
        if let Err(err) = outcome {
            warn!(
                "Failed to recreate {} vdevices on device {} after a partial destroy: {}",
                ids.len(),
                device,
                err
            );
        }
    }

    /// Change the quota of a stopped virtual device, returning the new quota
    pub fn update_single_vdevice(&self, id: VDeviceId, update: QuotaUpdate) -> Result<ResourceQuota> {
        let result = self.update_single_vdevice_inner(id, update);
        self.reject("update_single_vdevice", result)
    }

    fn update_single_vdevice_inner(&self, id: VDeviceId, update: QuotaUpdate) -> Result<ResourceQuota> {
        let device = self.vdevice_device(id)?;
        let mut state = self.write_device(device)?;
        let quota = state.vdevices.check_update(id, update)?;

        self.driver_call(self.driver.update_vdevice(device, id, quota))?;
        state.vdevices.set_quota(id, quota)?;

        info!(
            "Updated vdevice {} to {} CUs / {} MiB",
            id, quota.compute_units, quota.memory_mb
        );
        Ok(quota)
    }

    /// Take a start on a virtual device; the driver starts it on the first one
    pub fn start_vdevice(&self, id: VDeviceId) -> Result<()> {
        let result = self.start_vdevice_inner(id);
        self.reject("start_vdevice", result)
    }

    fn start_vdevice_inner(&self, id: VDeviceId) -> Result<()> {
        let device = self.vdevice_device(id)?;
        let mut state = self.write_device(device)?;
        let starts = state.vdevices.starts(id)?;

        if starts == 0 {
            self.driver_call(self.driver.start_vdevice(device, id))?;
            info!("Started vdevice {} on device {}", id, device);
        }
        state.vdevices.set_starts(id, starts + 1)?;
        debug!("vdevice {} has {} outstanding starts", id, starts + 1);
        Ok(())
    }

    /// Release a start; the driver stops the device when the last one goes
    pub fn stop_vdevice(&self, id: VDeviceId) -> Result<()> {
        let result = self.stop_vdevice_inner(id);
        self.reject("stop_vdevice", result)
    }

    fn stop_vdevice_inner(&self, id: VDeviceId) -> Result<()> {
        let device = self.vdevice_device(id)?;
        let mut state = self.write_device(device)?;
        let starts = state.vdevices.starts(id)?;

        if starts == 0 {
            return Err(Error::invalid_argument(format!(
                "vdevice {} has no outstanding start",
                id
            )));
        }
        if starts == 1 {
            self.driver_call(self.driver.stop_vdevice(device, id))?;
            info!("Stopped vdevice {} on device {}", id, device);
        }
        state.vdevices.set_starts(id, starts - 1)?;
        Ok(())
    }

    /// Start a virtual device for the lifetime of the returned guard
    pub fn start_vdevice_scoped(&self, id: VDeviceId) -> Result<RunningVDevice<'_>> {
        self.start_vdevice(id)?;
        Ok(RunningVDevice {
            manager: self,
            id,
            stopped: false,
        })
    }

    /// Per-device vdevice limit; zero when virtualization is unsupported
    pub fn max_vdevice_count(&self, device: DeviceIndex) -> Result<u32> {
        let state = self.read_device(device)?;
        if !self.info(device)?.virtualization_capable {
            return Ok(0);
        }
        Ok(state.vdevices.max_count())
    }

    pub fn vdevice_count(&self, device: DeviceIndex) -> Result<u32> {
        Ok(self.read_device(device)?.vdevices.len() as u32)
    }

    pub fn vdevice_info(&self, id: VDeviceId) -> Result<VDeviceInfo> {
        let device = self.vdevice_device(id)?;
        self.read_device(device)?.vdevices.info(id)
    }

    /// Virtual devices of a device, ordered by ID
    pub fn vdevices_of(&self, device: DeviceIndex) -> Result<Vec<VDeviceInfo>> {
        let state = self.read_device(device)?;
        state
            .vdevices
            .ids()
            .into_iter()
            .map(|id| state.vdevices.info(id))
            .collect()
    }

    /// Compute units and memory not yet promised to a virtual device
    pub fn device_remaining(&self, device: DeviceIndex) -> Result<ResourceQuota> {
        Ok(self.read_device(device)?.vdevices.remaining())
    }

    /// Record the container a virtual device is handed to
    pub fn bind_container(&self, id: VDeviceId, container_id: impl Into<String>) -> Result<()> {
        let device = self.vdevice_device(id)?;
        let container_id = container_id.into();
        debug!("Binding vdevice {} to container {}", id, container_id);
        self.write_device(device)?
            .vdevices
            .bind_container(id, Some(container_id))
    }

    pub fn unbind_container(&self, id: VDeviceId) -> Result<()> {
        let device = self.vdevice_device(id)?;
        self.write_device(device)?.vdevices.bind_container(id, None)
    }

    pub fn vdevice_busy_percent(&self, id: VDeviceId) -> Result<u32> {
        let device = self.vdevice_device(id)?;
        let state = self.read_device(device)?;
        if !state.vdevices.contains(id) {
            return Err(Error::vdevice_not_exist(format!("vdevice {}", id)));
        }
        self.driver_call(self.driver.vdevice_busy_percent(device, id))
    }

    /// Owning device of a virtual device; the caller re-checks under the lock
    fn vdevice_device(&self, id: VDeviceId) -> Result<DeviceIndex> {
        self.ensure_initialized()?;
        self.vdevice_owner
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::vdevice_not_exist(format!("vdevice {}", id)))
    }
}
