//! GPU instance, compute instance and MIG device operations

use super::DeviceManager;
use crate::catalog::{
    self, ComputeInstanceProfileInfo, GpuInstanceProfileInfo,
    COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
};
use crate::handle::{ComputeInstanceHandle, GpuInstanceHandle, MigDeviceHandle};
use crate::placement;
use crate::registry::{ComputeInstanceRecord, GpuInstanceRecord};
use crate::stats::ManagerStats;
use dcuvirt_core::{
    ComputeInstanceId, DeviceAttributes, DeviceIndex, Error, GpuInstanceId, PhysicalDeviceInfo,
    Placement, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Snapshot of a GPU instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInstanceInfo {
    pub device: DeviceIndex,
    pub id: GpuInstanceId,
    pub profile_id: u32,
    pub placement: Placement,
}

/// Snapshot of a compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstanceInfo {
    pub device: DeviceIndex,
    pub gpu_instance: GpuInstanceId,
    pub id: ComputeInstanceId,
    pub profile_id: u32,
    pub engine_profile_id: u32,
    pub placement: Placement,
}

impl DeviceManager {
    /// Shape of a GPU instance profile on a device in MIG mode
    pub fn gpu_instance_profile_info(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<GpuInstanceProfileInfo> {
        let state = self.read_device(device)?;
        let info = self.info(device)?;
        state.ensure_mig_enabled(info)?;
        catalog::gpu_instance_profile(info, profile_id)
    }

    /// Every placement a GPU instance of the profile could take, ignoring occupancy
    pub fn gpu_instance_possible_placements(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<Vec<Placement>> {
        let profile = self.gpu_instance_profile_info(device, profile_id)?;
        let total = self.info(device)?.memory_slices;
        Ok(placement::possible_placements(total, profile.slice_count))
    }

    pub fn gpu_instance_possible_placement_count(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<u32> {
        let profile = self.gpu_instance_profile_info(device, profile_id)?;
        let total = self.info(device)?.memory_slices;
        Ok(placement::placement_count(total, profile.slice_count))
    }

    /// Fill `buf` with candidate placements; `INSUFFICIENT_SIZE` if it is too short
    pub fn gpu_instance_possible_placements_into(
        &self,
        device: DeviceIndex,
        profile_id: u32,
        buf: &mut [Placement],
    ) -> Result<usize> {
        let profile = self.gpu_instance_profile_info(device, profile_id)?;
        let total = self.info(device)?.memory_slices;
        placement::possible_placements_into(total, profile.slice_count, buf)
    }

    /// How many more GPU instances of the profile fit the current occupancy
    pub fn gpu_instance_remaining_capacity(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<u32> {
        let state = self.read_device(device)?;
        let info = self.info(device)?;
        state.ensure_mig_enabled(info)?;
        let profile = catalog::gpu_instance_profile(info, profile_id)?;
        Ok(state.mig.remaining_capacity(&profile))
    }

    /// Create a GPU instance at the lowest free placement
    pub fn create_gpu_instance(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<GpuInstanceHandle> {
        let result = self.create_gpu_instance_at(device, profile_id, None);
        self.reject("create_gpu_instance", result)
    }

    /// Create a GPU instance at a caller-chosen placement
    pub fn create_gpu_instance_with_placement(
        &self,
        device: DeviceIndex,
        profile_id: u32,
        placement: Placement,
    ) -> Result<GpuInstanceHandle> {
        let result = self.create_gpu_instance_at(device, profile_id, Some(placement));
        self.reject("create_gpu_instance_with_placement", result)
    }

    fn create_gpu_instance_at(
        &self,
        device: DeviceIndex,
        profile_id: u32,
        requested: Option<Placement>,
    ) -> Result<GpuInstanceHandle> {
        let mut state = self.write_device(device)?;
        let info = self.info(device)?;
        state.ensure_mig_enabled(info)?;
        let profile = catalog::gpu_instance_profile(info, profile_id)?;

        let key = state.mig.create_gpu_instance(profile, requested, |id, placement| {
            self.driver_call(self.driver.program_gpu_instance(device, id, placement))
        })?;

        let record = state.mig.gpu_instance(key)?;
        ManagerStats::bump(&self.stats.gpu_instances_created, 1);
        info!(
            "Created gpu instance {} ({}) at {} on device {}",
            record.id, record.profile.name, record.placement, device
        );
        Ok(GpuInstanceHandle { device, key })
    }

    /// Destroy a GPU instance; `IN_USE` while compute instances or workloads remain
    pub fn destroy_gpu_instance(&self, handle: GpuInstanceHandle) -> Result<()> {
        let result = self.destroy_gpu_instance_inner(handle);
        self.reject("destroy_gpu_instance", result)
    }

    fn destroy_gpu_instance_inner(&self, handle: GpuInstanceHandle) -> Result<()> {
        let device = handle.device;
        let mut state = self.write_device(device)?;

        let record = state.mig.destroy_gpu_instance(handle.key, |record| {
            if self.driver_call(self.driver.instance_in_use(device, record.id, None))? {
                return Err(Error::in_use(format!(
                    "gpu instance {} has an attached workload",
                    record.id
                )));
            }
            self.driver_call(self.driver.release_gpu_instance(device, record.id))
        })?;

        ManagerStats::bump(&self.stats.gpu_instances_destroyed, 1);
        info!(
            "Destroyed gpu instance {} at {} on device {}",
            record.id, record.placement, device
        );
        Ok(())
    }

    pub fn gpu_instance_by_id(
        &self,
        device: DeviceIndex,
        id: GpuInstanceId,
    ) -> Result<GpuInstanceHandle> {
        let state = self.read_device(device)?;
        state.ensure_mig_enabled(self.info(device)?)?;
        let key = state.mig.gpu_instance_by_id(id)?;
        Ok(GpuInstanceHandle { device, key })
    }

    /// Live GPU instances of a profile, ordered by ID
    pub fn gpu_instances(
        &self,
        device: DeviceIndex,
        profile_id: u32,
    ) -> Result<Vec<GpuInstanceHandle>> {
        let state = self.read_device(device)?;
        let info = self.info(device)?;
        state.ensure_mig_enabled(info)?;
        catalog::gpu_instance_profile(info, profile_id)?;

        Ok(state
            .mig
            .gpu_instances()
            .into_iter()
            .filter(|(_, record)| record.profile.id == profile_id)
            .map(|(key, _)| GpuInstanceHandle { device, key })
            .collect())
    }

    pub fn gpu_instance_info(&self, handle: GpuInstanceHandle) -> Result<GpuInstanceInfo> {
        self.with_gpu_instance(handle, |_, record| {
            Ok(GpuInstanceInfo {
                device: handle.device,
                id: record.id,
                profile_id: record.profile.id,
                placement: record.placement,
            })
        })
    }

    /// Shape of a compute instance profile inside a GPU instance
    pub fn compute_instance_profile_info(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
        engine_profile_id: u32,
    ) -> Result<ComputeInstanceProfileInfo> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            catalog::compute_instance_profile(&record.profile, profile_id, engine_profile_id)
        })
    }

    pub fn compute_instance_possible_placements(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
    ) -> Result<Vec<Placement>> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            let profile = shared_compute_profile(record, profile_id)?;
            Ok(placement::possible_placements(
                record.profile.slice_count,
                profile.slice_count,
            ))
        })
    }

    pub fn compute_instance_possible_placement_count(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
    ) -> Result<u32> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            let profile = shared_compute_profile(record, profile_id)?;
            Ok(placement::placement_count(
                record.profile.slice_count,
                profile.slice_count,
            ))
        })
    }

    pub fn compute_instance_possible_placements_into(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
        buf: &mut [Placement],
    ) -> Result<usize> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            let profile = shared_compute_profile(record, profile_id)?;
            placement::possible_placements_into(record.profile.slice_count, profile.slice_count, buf)
        })
    }

    pub fn compute_instance_remaining_capacity(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
    ) -> Result<u32> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            let profile = shared_compute_profile(record, profile_id)?;
            Ok(record.remaining_capacity(&profile))
        })
    }

    /// Create a compute instance at the lowest free compute-slice placement
    pub fn create_compute_instance(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
    ) -> Result<ComputeInstanceHandle> {
        let result = self.create_compute_instance_at(gpu_instance, profile_id, None);
        self.reject("create_compute_instance", result)
    }

    pub fn create_compute_instance_with_placement(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
        placement: Placement,
    ) -> Result<ComputeInstanceHandle> {
        let result = self.create_compute_instance_at(gpu_instance, profile_id, Some(placement));
        self.reject("create_compute_instance_with_placement", result)
    }

    fn create_compute_instance_at(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
        requested: Option<Placement>,
    ) -> Result<ComputeInstanceHandle> {
        let device = gpu_instance.device;
        let mut state = self.write_device(device)?;
        state.ensure_mig_enabled(self.info(device)?)?;

        let parent = state.mig.gpu_instance_mut(gpu_instance.key)?;
        let profile = shared_compute_profile(parent, profile_id)?;
        let parent_id = parent.id;

        let key = parent.create_compute_instance(
            profile,
            COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
            requested,
            |id, placement| {
                self.driver_call(
                    self.driver
                        .program_compute_instance(device, parent_id, id, placement),
                )
            },
        )?;

        let record = parent.compute_instance(key)?;
        ManagerStats::bump(&self.stats.compute_instances_created, 1);
        info!(
            "Created compute instance {} ({}) at {} in gpu instance {} on device {}",
            record.id, record.profile.name, record.placement, parent_id, device
        );
        Ok(ComputeInstanceHandle { gpu_instance, key })
    }

    /// Destroy a compute instance; `IN_USE` while a workload is attached
    pub fn destroy_compute_instance(&self, handle: ComputeInstanceHandle) -> Result<()> {
        let result = self.destroy_compute_instance_inner(handle);
        self.reject("destroy_compute_instance", result)
    }

    fn destroy_compute_instance_inner(&self, handle: ComputeInstanceHandle) -> Result<()> {
        let device = handle.device();
        let mut state = self.write_device(device)?;
        let parent = state.mig.gpu_instance_mut(handle.gpu_instance.key)?;
        let parent_id = parent.id;

        let record = parent.destroy_compute_instance(handle.key, |record| {
            if self.driver_call(self.driver.instance_in_use(device, parent_id, Some(record.id)))? {
                return Err(Error::in_use(format!(
                    "compute instance {} has an attached workload",
                    record.id
                )));
            }
            self.driver_call(
                self.driver
                    .release_compute_instance(device, parent_id, record.id),
            )
        })?;

        ManagerStats::bump(&self.stats.compute_instances_destroyed, 1);
        info!(
            "Destroyed compute instance {} in gpu instance {} on device {}",
            record.id, parent_id, device
        );
        Ok(())
    }

    pub fn compute_instance_by_id(
        &self,
        gpu_instance: GpuInstanceHandle,
        id: ComputeInstanceId,
    ) -> Result<ComputeInstanceHandle> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            let key = record.compute_instance_by_id(id)?;
            Ok(ComputeInstanceHandle { gpu_instance, key })
        })
    }

    /// Live compute instances of a profile, ordered by ID
    pub fn compute_instances(
        &self,
        gpu_instance: GpuInstanceHandle,
        profile_id: u32,
    ) -> Result<Vec<ComputeInstanceHandle>> {
        self.with_gpu_instance(gpu_instance, |_, record| {
            shared_compute_profile(record, profile_id)?;
            Ok(record
                .compute_instances()
                .into_iter()
                .filter(|(_, ci)| ci.profile.id == profile_id)
                .map(|(key, _)| ComputeInstanceHandle { gpu_instance, key })
                .collect())
        })
    }

    pub fn compute_instance_info(&self, handle: ComputeInstanceHandle) -> Result<ComputeInstanceInfo> {
        self.with_compute_instance(handle, |_, parent, record| {
            Ok(ComputeInstanceInfo {
                device: handle.device(),
                gpu_instance: parent.id,
                id: record.id,
                profile_id: record.profile.id,
                engine_profile_id: record.engine_profile_id,
                placement: record.placement,
            })
        })
    }

    /// Upper bound on MIG device indices; zero when MIG is unsupported or off
    pub fn max_mig_device_count(&self, device: DeviceIndex) -> Result<u32> {
        let state = self.read_device(device)?;
        let info = self.info(device)?;
        if state.ensure_mig_enabled(info).is_err() {
            return Ok(0);
        }
        Ok(info.memory_slices)
    }

    /// Resolve the compute instance currently listed at `index`
    pub fn mig_device_handle_by_index(
        &self,
        device: DeviceIndex,
        index: u32,
    ) -> Result<MigDeviceHandle> {
        let state = self.read_device(device)?;
        let info = self.info(device)?;
        state.ensure_mig_enabled(info)?;

        if index >= info.memory_slices {
            return Err(Error::invalid_argument(format!(
                "MIG device index {} beyond {}",
                index, info.memory_slices
            )));
        }

        let (gi_key, ci_key) = state
            .mig
            .mig_devices()
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::not_found(format!("MIG device {} on device {}", index, device)))?;

        debug!("Resolved MIG device {} on device {}", index, device);
        Ok(MigDeviceHandle {
            index,
            compute_instance: ComputeInstanceHandle {
                gpu_instance: GpuInstanceHandle {
                    device,
                    key: gi_key,
                },
                key: ci_key,
            },
        })
    }

    pub fn mig_device_gpu_instance_id(&self, handle: MigDeviceHandle) -> Result<GpuInstanceId> {
        self.with_compute_instance(handle.compute_instance, |_, parent, _| Ok(parent.id))
    }

    pub fn mig_device_compute_instance_id(
        &self,
        handle: MigDeviceHandle,
    ) -> Result<ComputeInstanceId> {
        self.with_compute_instance(handle.compute_instance, |_, _, record| Ok(record.id))
    }

    /// Physical device of a MIG device that is still live
    pub fn mig_device_parent(&self, handle: MigDeviceHandle) -> Result<DeviceIndex> {
        self.with_compute_instance(handle.compute_instance, |info, _, _| Ok(info.index))
    }

    pub fn mig_device_attributes(&self, handle: MigDeviceHandle) -> Result<DeviceAttributes> {
        self.with_compute_instance(handle.compute_instance, |info, parent, record| {
            Ok(DeviceAttributes {
                index: handle.index,
                compute_units: record.profile.compute_units,
                memory_mb: parent.profile.memory_mb,
                uuid: format!("MIG-{}/{}/{}", info.uuid, parent.id, record.id),
                name: format!("{} MIG {}", info.name, record.profile.name),
                gpu_instance_slice_count: parent.profile.slice_count,
                compute_instance_slice_count: record.profile.slice_count,
            })
        })
    }

    fn with_gpu_instance<T, F>(&self, handle: GpuInstanceHandle, f: F) -> Result<T>
    where
        F: FnOnce(&PhysicalDeviceInfo, &GpuInstanceRecord) -> Result<T>,
    {
        let state = self.read_device(handle.device)?;
        let record = state.mig.gpu_instance(handle.key)?;
        f(self.info(handle.device)?, record)
    }

    fn with_compute_instance<T, F>(&self, handle: ComputeInstanceHandle, f: F) -> Result<T>
    where
        F: FnOnce(&PhysicalDeviceInfo, &GpuInstanceRecord, &ComputeInstanceRecord) -> Result<T>,
    {
        let device = handle.device();
        let state = self.read_device(device)?;
        let parent = state.mig.gpu_instance(handle.gpu_instance.key)?;
        let record = parent.compute_instance(handle.key)?;
        f(self.info(device)?, parent, record)
    }
}

fn shared_compute_profile(
    parent: &GpuInstanceRecord,
    profile_id: u32,
) -> Result<ComputeInstanceProfileInfo> {
    catalog::compute_instance_profile(
        &parent.profile,
        profile_id,
        COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
    )
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::catalog::{
        COMPUTE_INSTANCE_PROFILE_1_SLICE, COMPUTE_INSTANCE_PROFILE_2_SLICE,
        GPU_INSTANCE_PROFILE_1_SLICE, GPU_INSTANCE_PROFILE_2_SLICE, GPU_INSTANCE_PROFILE_4_SLICE,
    };
    use dcuvirt_adapter_driver::mock::MockOp;
    use dcuvirt_adapter_driver::DriverError;
    use dcuvirt_core::{MigMode, StatusCode};
    use std::sync::{Arc, Barrier};
    use std::thread;

    const DEV: DeviceIndex = DeviceIndex(0);

    #[test]
    fn test_four_slice_instances_fill_device() {
        let (manager, driver) = mig_manager();

        let a = manager.create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE).unwrap();
        let b = manager.create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE).unwrap();
        assert_eq!(manager.gpu_instance_info(a).unwrap().placement, Placement::new(0, 4));
        assert_eq!(manager.gpu_instance_info(b).unwrap().placement, Placement::new(4, 4));

        let err = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InsufficientResources);

        assert_eq!(
            driver.programmed_gpu_instances(DEV),
            vec![Placement::new(0, 4), Placement::new(4, 4)]
        );
        let stats = manager.stats();
        assert_eq!(stats.gpu_instances_created, 2);
        assert_eq!(stats.placement_conflicts, 1);
        assert_eq!(stats.rejected_mutations, 1);
    }

    #[test]
    fn test_destroy_restores_candidates_and_capacity() {
        let (manager, _) = mig_manager();
        let placements_before = manager
            .gpu_instance_possible_placements(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        let capacity_before = manager
            .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();

        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        manager.destroy_gpu_instance(gi).unwrap();

        assert_eq!(
            manager
                .gpu_instance_possible_placements(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            placements_before
        );
        assert_eq!(
            manager
                .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            capacity_before
        );
        assert_eq!(manager.gpu_instance_info(gi).unwrap_err().status(), StatusCode::NotFound);
    }

    #[test]
    fn test_capacity_decreases_by_unplaceable_positions() {
        let (manager, _) = mig_manager();
        assert_eq!(
            manager
                .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            4
        );

        manager
            .create_gpu_instance_with_placement(
                DEV,
                GPU_INSTANCE_PROFILE_1_SLICE,
                Placement::new(1, 1),
            )
            .unwrap();

        // slice 0 is stranded, so a single slice costs one 2-slice instance
        assert_eq!(
            manager
                .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            3
        );
        assert_eq!(
            manager
                .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_1_SLICE)
                .unwrap(),
            7
        );
    }

    #[test]
    fn test_concurrent_overlapping_creates() {
        let (manager, driver) = mig_manager();
        let manager = Arc::new(manager);
        let barrier = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|start| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.create_gpu_instance_with_placement(
                        DEV,
                        GPU_INSTANCE_PROFILE_4_SLICE,
                        Placement::new(start, 4),
                    )
                })
            })
            .collect();

        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let won = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(won, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert_eq!(
                result.as_ref().unwrap_err().status(),
                StatusCode::InsufficientResources
            );
        }
        assert_eq!(driver.programmed_gpu_instances(DEV).len(), 1);
    }

    #[test]
    fn test_concurrent_creates_never_overlap() {
        let (manager, driver) = mig_manager();
        let manager = Arc::new(manager);
        let barrier = Arc::new(Barrier::new(6));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                })
            })
            .collect();

        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);

        let placements = driver.programmed_gpu_instances(DEV);
        for (i, a) in placements.iter().enumerate() {
            for b in &placements[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_destroy_gpu_instance_with_compute_instance() {
        let (manager, _) = mig_manager();
        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        let ci = manager
            .create_compute_instance(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE)
            .unwrap();
        let mig = manager.mig_device_handle_by_index(DEV, 0).unwrap();
        assert_eq!(manager.mig_device_compute_instance_id(mig).unwrap(), ComputeInstanceId(0));

        let err = manager.destroy_gpu_instance(gi).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
        assert!(err.is_retryable());

        manager.destroy_compute_instance(ci).unwrap();
        manager.destroy_gpu_instance(gi).unwrap();

        assert_eq!(
            manager.mig_device_attributes(mig).unwrap_err().status(),
            StatusCode::NotFound
        );
        assert_eq!(
            manager.mig_device_parent(mig).unwrap_err().status(),
            StatusCode::NotFound
        );
    }

    #[test]
    fn test_attached_workload_blocks_destroy() {
        let (manager, driver) = mig_manager();
        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        let ci = manager
            .create_compute_instance(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE)
            .unwrap();

        driver.set_in_use(DEV, GpuInstanceId(0), Some(ComputeInstanceId(0)), true);
        let err = manager.destroy_compute_instance(ci).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
        assert_eq!(driver.programmed_compute_instance_count(DEV), 1);

        driver.set_in_use(DEV, GpuInstanceId(0), Some(ComputeInstanceId(0)), false);
        manager.destroy_compute_instance(ci).unwrap();

        driver.set_in_use(DEV, GpuInstanceId(0), None, true);
        let err = manager.destroy_gpu_instance(gi).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
        assert!(manager.gpu_instance_info(gi).is_ok());
    }

    #[test]
    fn test_driver_failure_rolls_back() {
        let (manager, driver) = mig_manager();
        driver.fail_next(
            MockOp::ProgramGpuInstance,
            DriverError::CommunicationError("timeout".to_string()),
        );

        let err = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unknown);
        assert_eq!(
            manager
                .gpu_instance_remaining_capacity(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
                .unwrap(),
            2
        );
        assert_eq!(manager.stats().driver_failures, 1);

        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap();
        assert_eq!(manager.gpu_instance_info(gi).unwrap().id, GpuInstanceId(0));
    }

    #[test]
    fn test_mig_disabled_rejects_creates() {
        let (manager, _) = manager(1);
        let err = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_1_SLICE)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NotSupported);
        assert_eq!(manager.max_mig_device_count(DEV).unwrap(), 0);
    }

    #[test]
    fn test_profile_errors() {
        let (manager, _) = mig_manager();
        assert_eq!(
            manager.create_gpu_instance(DEV, 9).unwrap_err().status(),
            StatusCode::InvalidArgument
        );

        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_1_SLICE)
            .unwrap();
        assert_eq!(
            manager
                .create_compute_instance(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE)
                .unwrap_err()
                .status(),
            StatusCode::NotSupported
        );
        assert_eq!(
            manager
                .compute_instance_profile_info(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE, 1)
                .unwrap_err()
                .status(),
            StatusCode::InvalidArgument
        );
    }

    #[test]
    fn test_placement_queries() {
        let (manager, _) = mig_manager();
        assert_eq!(
            manager
                .gpu_instance_possible_placement_count(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
                .unwrap(),
            5
        );

        let mut buf = [Placement::new(0, 0); 4];
        let err = manager
            .gpu_instance_possible_placements_into(DEV, GPU_INSTANCE_PROFILE_4_SLICE, &mut buf)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InsufficientSize);

        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap();
        assert_eq!(
            manager
                .compute_instance_possible_placements(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            vec![Placement::new(0, 2), Placement::new(1, 2), Placement::new(2, 2)]
        );
        assert_eq!(
            manager
                .compute_instance_possible_placements_into(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE, &mut buf)
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_profile_queries_need_mig_mode() {
        let (manager, _) = manager(1);
        assert_eq!(
            manager
                .gpu_instance_profile_info(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap_err()
                .status(),
            StatusCode::NotSupported
        );
        assert_eq!(
            manager
                .gpu_instance_possible_placements(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap_err()
                .status(),
            StatusCode::NotSupported
        );
        assert_eq!(
            manager
                .gpu_instance_possible_placement_count(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap_err()
                .status(),
            StatusCode::NotSupported
        );

        manager.set_mig_mode(DEV, MigMode::Enabled).unwrap();
        let profile = manager
            .gpu_instance_profile_info(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        assert_eq!(profile.slice_count, 2);
        assert_eq!(
            manager
                .gpu_instance_possible_placement_count(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            7
        );
    }

    #[test]
    fn test_compute_instance_lifecycle() {
        let (manager, _) = mig_manager();
        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap();

        let ci = manager
            .create_compute_instance_with_placement(
                gi,
                COMPUTE_INSTANCE_PROFILE_2_SLICE,
                Placement::new(1, 2),
            )
            .unwrap();
        assert_eq!(
            manager
                .compute_instance_remaining_capacity(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            0
        );
        assert_eq!(
            manager
                .compute_instance_remaining_capacity(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE)
                .unwrap(),
            2
        );

        let info = manager.compute_instance_info(ci).unwrap();
        assert_eq!(info.gpu_instance, GpuInstanceId(0));
        assert_eq!(info.engine_profile_id, COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED);
        assert_eq!(info.placement, Placement::new(1, 2));

        assert_eq!(
            manager.compute_instance_by_id(gi, ComputeInstanceId(0)).unwrap(),
            ci
        );
        assert_eq!(
            manager
                .compute_instances(gi, COMPUTE_INSTANCE_PROFILE_2_SLICE)
                .unwrap(),
            vec![ci]
        );
        assert!(manager
            .compute_instances(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_gpu_instance_lookups() {
        let (manager, _) = mig_manager();
        let small = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_1_SLICE)
            .unwrap();
        let large = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_4_SLICE)
            .unwrap();

        assert_eq!(manager.gpu_instance_by_id(DEV, GpuInstanceId(1)).unwrap(), large);
        assert_eq!(
            manager
                .gpu_instance_by_id(DEV, GpuInstanceId(7))
                .unwrap_err()
                .status(),
            StatusCode::NotFound
        );
        assert_eq!(
            manager.gpu_instances(DEV, GPU_INSTANCE_PROFILE_1_SLICE).unwrap(),
            vec![small]
        );
    }

    #[test]
    fn test_mig_device_handles() {
        let (manager, _) = mig_manager();
        assert_eq!(manager.max_mig_device_count(DEV).unwrap(), 8);

        let gi = manager
            .create_gpu_instance(DEV, GPU_INSTANCE_PROFILE_2_SLICE)
            .unwrap();
        manager
            .create_compute_instance(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE)
            .unwrap();
        manager
            .create_compute_instance(gi, COMPUTE_INSTANCE_PROFILE_1_SLICE)
            .unwrap();

        let second = manager.mig_device_handle_by_index(DEV, 1).unwrap();
        assert_eq!(second.parent(), DEV);
        assert_eq!(manager.mig_device_gpu_instance_id(second).unwrap(), GpuInstanceId(0));
        assert_eq!(
            manager.mig_device_compute_instance_id(second).unwrap(),
            ComputeInstanceId(1)
        );

        let uuid = manager.device_uuid(DEV).unwrap();
        let attrs = manager.mig_device_attributes(second).unwrap();
        assert_eq!(attrs.uuid, format!("MIG-{}/0/1", uuid));
        assert_eq!(attrs.gpu_instance_slice_count, 2);
        assert_eq!(attrs.compute_instance_slice_count, 1);

        assert_eq!(
            manager.mig_device_handle_by_index(DEV, 2).unwrap_err().status(),
            StatusCode::NotFound
        );
        assert_eq!(
            manager.mig_device_handle_by_index(DEV, 8).unwrap_err().status(),
            StatusCode::InvalidArgument
        );
    }

    #[test]
    fn test_mig_mode_off_hides_mig_devices() {
        let (manager, _) = mig_manager();
        manager.set_mig_mode(DEV, MigMode::Disabled).unwrap();
        assert_eq!(
            manager.mig_device_handle_by_index(DEV, 0).unwrap_err().status(),
            StatusCode::NotSupported
        );
    }
}
