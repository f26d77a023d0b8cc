//! Instance registry
//!
//! Per-device record of live GPU instances and, nested inside each, its
//! compute instances. Creation reserves slices first and hands the chosen
//! placement to a `program` callback (the driver call); if the callback fails
//! the reservation is rolled back and no ID is consumed. Destruction runs the
//! `release` callback before touching any state.

use crate::arena::{Arena, ArenaKey};
use crate::catalog::{ComputeInstanceProfileInfo, GpuInstanceProfileInfo};
use crate::occupancy::SliceOccupancy;
use crate::placement::validate_placement;
use dcuvirt_core::{ComputeInstanceId, Error, GpuInstanceId, Placement, Result};
use tracing::debug;

/// Live compute instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeInstanceRecord {
    pub id: ComputeInstanceId,
    pub profile: ComputeInstanceProfileInfo,
    pub engine_profile_id: u32,
    /// Compute slices within the parent GPU instance
    pub placement: Placement,
}

/// Live GPU instance
#[derive(Debug)]
pub struct GpuInstanceRecord {
    pub id: GpuInstanceId,
    pub profile: GpuInstanceProfileInfo,
    /// Memory slices on the device
    pub placement: Placement,
    compute_slices: SliceOccupancy,
    compute_instances: Arena<ComputeInstanceRecord>,
    next_compute_id: u32,
}

fn choose_placement(
    occupancy: &SliceOccupancy,
    size: u32,
    requested: Option<Placement>,
) -> Result<Placement> {
    match requested {
        Some(placement) => {
            validate_placement(occupancy.total(), size, placement)?;
            if !occupancy.is_free(placement) {
                return Err(Error::insufficient_resources(format!(
                    "placement {} overlaps a live instance",
                    placement
                )));
            }
            Ok(placement)
        }
        None => occupancy.first_fit(size).ok_or_else(|| {
            Error::insufficient_resources(format!(
                "no free {}-slice placement among {} slices",
                size,
                occupancy.total()
            ))
        }),
    }
}

impl GpuInstanceRecord {
    fn new(id: GpuInstanceId, profile: GpuInstanceProfileInfo, placement: Placement) -> Result<Self> {
        Ok(Self {
            id,
            compute_slices: SliceOccupancy::new(profile.slice_count)?,
            profile,
            placement,
            compute_instances: Arena::new(),
            next_compute_id: 0,
        })
    }

    pub fn compute_slices(&self) -> &SliceOccupancy {
        &self.compute_slices
    }

    pub fn compute_instance_count(&self) -> usize {
        self.compute_instances.len()
    }

    pub fn compute_instance(&self, key: ArenaKey) -> Result<&ComputeInstanceRecord> {
        self.compute_instances.get(key).ok_or_else(|| {
            Error::not_found(format!("compute instance in gpu instance {}", self.id))
        })
    }

    pub fn compute_instance_by_id(&self, id: ComputeInstanceId) -> Result<ArenaKey> {
        self.compute_instances
            .iter()
            .find(|(_, record)| record.id == id)
            .map(|(key, _)| key)
            .ok_or_else(|| {
                Error::not_found(format!("compute instance {} in gpu instance {}", id, self.id))
            })
    }

    /// Live compute instances ordered by ID
    pub fn compute_instances(&self) -> Vec<(ArenaKey, &ComputeInstanceRecord)> {
        let mut records: Vec<_> = self.compute_instances.iter().collect();
        records.sort_by_key(|(_, record)| record.id);
        records
    }

    pub fn remaining_capacity(&self, profile: &ComputeInstanceProfileInfo) -> u32 {
        self.compute_slices.remaining_capacity(profile.slice_count)
    }

    pub fn create_compute_instance<F>(
        &mut self,
        profile: ComputeInstanceProfileInfo,
        engine_profile_id: u32,
        requested: Option<Placement>,
        program: F,
    ) -> Result<ArenaKey>
    where
        F: FnOnce(ComputeInstanceId, Placement) -> Result<()>,
    {
        let placement = choose_placement(&self.compute_slices, profile.slice_count, requested)?;
        self.compute_slices.reserve(placement)?;

        let id = ComputeInstanceId(self.next_compute_id);
        if let Err(err) = program(id, placement) {
            self.compute_slices.release(placement);
            return Err(err);
        }
        self.next_compute_id += 1;

        debug!(
            "Committed compute instance {} at {} in gpu instance {}",
            id, placement, self.id
        );
        Ok(self.compute_instances.insert(ComputeInstanceRecord {
            id,
            profile,
            engine_profile_id,
            placement,
        }))
    }

    pub fn destroy_compute_instance<F>(
        &mut self,
        key: ArenaKey,
        release: F,
    ) -> Result<ComputeInstanceRecord>
    where
        F: FnOnce(&ComputeInstanceRecord) -> Result<()>,
    {
        release(self.compute_instance(key)?)?;

        let record = self
            .compute_instances
            .remove(key)
            .ok_or_else(|| Error::not_found("compute instance"))?;
        self.compute_slices.release(record.placement);
        Ok(record)
    }
}

/// Every GPU and compute instance of one device
#[derive(Debug)]
pub struct MigRegistry {
    memory_slices: SliceOccupancy,
    gpu_instances: Arena<GpuInstanceRecord>,
    next_gpu_id: u32,
}

impl MigRegistry {
    pub fn new(total_slices: u32) -> Result<Self> {
        Ok(Self {
            memory_slices: SliceOccupancy::new(total_slices)?,
            gpu_instances: Arena::new(),
            next_gpu_id: 0,
        })
    }

    pub fn memory_slices(&self) -> &SliceOccupancy {
        &self.memory_slices
    }

    pub fn gpu_instance_count(&self) -> usize {
        self.gpu_instances.len()
    }

    pub fn has_instances(&self) -> bool {
        !self.gpu_instances.is_empty()
    }

    pub fn gpu_instance(&self, key: ArenaKey) -> Result<&GpuInstanceRecord> {
        self.gpu_instances
            .get(key)
            .ok_or_else(|| Error::not_found("gpu instance"))
    }

    pub fn gpu_instance_mut(&mut self, key: ArenaKey) -> Result<&mut GpuInstanceRecord> {
        self.gpu_instances
            .get_mut(key)
            .ok_or_else(|| Error::not_found("gpu instance"))
    }

    pub fn gpu_instance_by_id(&self, id: GpuInstanceId) -> Result<ArenaKey> {
        self.gpu_instances
            .iter()
            .find(|(_, record)| record.id == id)
            .map(|(key, _)| key)
            .ok_or_else(|| Error::not_found(format!("gpu instance {}", id)))
    }

    /// Live GPU instances ordered by ID
    pub fn gpu_instances(&self) -> Vec<(ArenaKey, &GpuInstanceRecord)> {
        let mut records: Vec<_> = self.gpu_instances.iter().collect();
        records.sort_by_key(|(_, record)| record.id);
        records
    }

    pub fn remaining_capacity(&self, profile: &GpuInstanceProfileInfo) -> u32 {
        self.memory_slices.remaining_capacity(profile.slice_count)
    }

    /// Compute instances of the device ordered by (GPU instance ID, compute instance ID)
    pub fn mig_devices(&self) -> Vec<(ArenaKey, ArenaKey)> {
        self.gpu_instances()
            .into_iter()
            .flat_map(|(gi_key, gi)| {
                gi.compute_instances()
                    .into_iter()
                    .map(move |(ci_key, _)| (gi_key, ci_key))
            })
            .collect()
    }

    pub fn create_gpu_instance<F>(
        &mut self,
        profile: GpuInstanceProfileInfo,
        requested: Option<Placement>,
        program: F,
    ) -> Result<ArenaKey>
    where
        F: FnOnce(GpuInstanceId, Placement) -> Result<()>,
    {
        let placement = choose_placement(&self.memory_slices, profile.slice_count, requested)?;
        let id = GpuInstanceId(self.next_gpu_id);
        let record = GpuInstanceRecord::new(id, profile, placement)?;

        self.memory_slices.reserve(placement)?;
        if let Err(err) = program(id, placement) {
            self.memory_slices.release(placement);
            return Err(err);
        }
        self.next_gpu_id += 1;

        debug!("Committed gpu instance {} at {}", id, placement);
        Ok(self.gpu_instances.insert(record))
    }

    /// Destroy a GPU instance that has no compute instances left
    pub fn destroy_gpu_instance<F>(&mut self, key: ArenaKey, release: F) -> Result<GpuInstanceRecord>
    where
        F: FnOnce(&GpuInstanceRecord) -> Result<()>,
    {
        let record = self.gpu_instance(key)?;
        if record.compute_instance_count() > 0 {
            return Err(Error::in_use(format!(
                "gpu instance {} has {} compute instances",
                record.id,
                record.compute_instance_count()
            )));
        }
        release(record)?;

        let record = self
            .gpu_instances
            .remove(key)
            .ok_or_else(|| Error::not_found("gpu instance"))?;
        self.memory_slices.release(record.placement);
        Ok(record)
    }

    /// Forget every instance; outstanding handles go stale, IDs keep counting
    pub fn reset(&mut self) {
        self.gpu_instances.clear();
        self.memory_slices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{compute_instance_profile, gpu_instance_profile};
    use dcuvirt_core::{DeviceIndex, PciInfo, PhysicalDeviceInfo, StatusCode};

    fn device() -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            index: DeviceIndex(0),
            name: "DCU".to_string(),
            uuid: "GPU-0".to_string(),
            serial: "0".to_string(),
            pci: PciInfo::new(0, 1, 0, 0),
            compute_units: 64,
            memory_mb: 32768,
            memory_slices: 8,
            mig_capable: true,
            virtualization_capable: true,
        }
    }

    fn ok<T>(_: T, _: Placement) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_fill_device_with_four_slice_instances() {
        let mut registry = MigRegistry::new(8).unwrap();
        let profile = gpu_instance_profile(&device(), 3).unwrap();

        let a = registry.create_gpu_instance(profile.clone(), None, ok).unwrap();
        let b = registry.create_gpu_instance(profile.clone(), None, ok).unwrap();
        assert_eq!(registry.gpu_instance(a).unwrap().placement, Placement::new(0, 4));
        assert_eq!(registry.gpu_instance(b).unwrap().placement, Placement::new(4, 4));

        let err = registry.create_gpu_instance(profile, None, ok).unwrap_err();
        assert_eq!(err.status(), StatusCode::InsufficientResources);
    }

    #[test]
    fn test_program_failure_rolls_back() {
        let mut registry = MigRegistry::new(8).unwrap();
        let profile = gpu_instance_profile(&device(), 1).unwrap();

        let err = registry
            .create_gpu_instance(profile.clone(), None, |_, _| Err(Error::driver("link down")))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unknown);
        assert!(registry.memory_slices().is_empty());
        assert_eq!(registry.gpu_instance_count(), 0);

        // the failed attempt did not consume an ID
        let key = registry.create_gpu_instance(profile, None, ok).unwrap();
        assert_eq!(registry.gpu_instance(key).unwrap().id, GpuInstanceId(0));
    }

    #[test]
    fn test_requested_placement() {
        let mut registry = MigRegistry::new(8).unwrap();
        let profile = gpu_instance_profile(&device(), 1).unwrap();

        registry
            .create_gpu_instance(profile.clone(), Some(Placement::new(2, 2)), ok)
            .unwrap();
        let err = registry
            .create_gpu_instance(profile.clone(), Some(Placement::new(3, 2)), ok)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InsufficientResources);

        let err = registry
            .create_gpu_instance(profile, Some(Placement::new(0, 3)), ok)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidArgument);
    }

    #[test]
    fn test_destroy_with_children_is_in_use() {
        let mut registry = MigRegistry::new(8).unwrap();
        let gi_profile = gpu_instance_profile(&device(), 1).unwrap();
        let ci_profile = compute_instance_profile(&gi_profile, 0, 0).unwrap();

        let gi = registry.create_gpu_instance(gi_profile, None, ok).unwrap();
        let ci = registry
            .gpu_instance_mut(gi)
            .unwrap()
            .create_compute_instance(ci_profile, 0, None, ok)
            .unwrap();

        let err = registry.destroy_gpu_instance(gi, |_| Ok(())).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);

        registry
            .gpu_instance_mut(gi)
            .unwrap()
            .destroy_compute_instance(ci, |_| Ok(()))
            .unwrap();
        registry.destroy_gpu_instance(gi, |_| Ok(())).unwrap();
        assert!(registry.memory_slices().is_empty());
        assert_eq!(
            registry.gpu_instance(gi).unwrap_err().status(),
            StatusCode::NotFound
        );
    }

    #[test]
    fn test_release_failure_keeps_record() {
        let mut registry = MigRegistry::new(8).unwrap();
        let profile = gpu_instance_profile(&device(), 0).unwrap();
        let gi = registry.create_gpu_instance(profile, None, ok).unwrap();

        let err = registry
            .destroy_gpu_instance(gi, |_| Err(Error::in_use("workload attached")))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
        assert!(registry.gpu_instance(gi).is_ok());
        assert_eq!(registry.memory_slices().used(), 1);
    }

    #[test]
    fn test_reset_keeps_ids_monotonic() {
        let mut registry = MigRegistry::new(8).unwrap();
        let profile = gpu_instance_profile(&device(), 0).unwrap();
        let old = registry.create_gpu_instance(profile.clone(), None, ok).unwrap();

        registry.reset();
        assert!(registry.gpu_instance(old).is_err());
        assert!(!registry.has_instances());

        let fresh = registry.create_gpu_instance(profile, None, ok).unwrap();
        assert_eq!(registry.gpu_instance(fresh).unwrap().id, GpuInstanceId(1));
        assert_eq!(registry.gpu_instance(fresh).unwrap().placement, Placement::new(0, 1));
    }

    #[test]
    fn test_mig_device_ordering() {
        let mut registry = MigRegistry::new(8).unwrap();
        let gi_profile = gpu_instance_profile(&device(), 1).unwrap();
        let ci_profile = compute_instance_profile(&gi_profile, 0, 0).unwrap();

        let first = registry.create_gpu_instance(gi_profile.clone(), None, ok).unwrap();
        let second = registry.create_gpu_instance(gi_profile, None, ok).unwrap();
        for gi in [second, first, first] {
            registry
                .gpu_instance_mut(gi)
                .unwrap()
                .create_compute_instance(ci_profile.clone(), 0, None, ok)
                .unwrap();
        }

        let ids: Vec<_> = registry
            .mig_devices()
            .into_iter()
            .map(|(gi, ci)| {
                let gi = registry.gpu_instance(gi).unwrap();
                (gi.id.get(), gi.compute_instance(ci).unwrap().id.get())
            })
            .collect();
        assert_eq!(ids, vec![(0, 0), (0, 1), (1, 0)]);
    }
}
