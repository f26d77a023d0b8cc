//! Legacy virtual-device table
//!
//! Quota based: virtual devices share the device's compute units and memory
//! additively, with no positional slices. A virtual device is running while
//! it has at least one outstanding start made through this context.

use dcuvirt_core::{DeviceIndex, Error, ResourceQuota, Result, VDeviceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quota change for [`crate::DeviceManager::update_single_vdevice`]; `None` keeps the field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub compute_units: Option<u32>,
    pub memory_mb: Option<u64>,
}

impl QuotaUpdate {
    pub fn new(compute_units: Option<u32>, memory_mb: Option<u64>) -> Self {
        Self {
            compute_units,
            memory_mb,
        }
    }

    /// Build from raw values where `-1` means "leave unchanged"
    pub fn from_raw(compute_units: i64, memory_mb: i64) -> Result<Self> {
        fn field(value: i64, name: &str) -> Result<Option<i64>> {
            match value {
                -1 => Ok(None),
                v if v < 0 => Err(Error::invalid_argument(format!(
                    "{} must be -1 or non-negative, got {}",
                    name, v
                ))),
                v => Ok(Some(v)),
            }
        }

        let compute_units = field(compute_units, "compute units")?
            .map(|v| {
                u32::try_from(v)
                    .map_err(|_| Error::invalid_argument(format!("compute units {} too large", v)))
            })
            .transpose()?;
        let memory_mb = field(memory_mb, "memory")?.map(|v| v as u64);

        Ok(Self {
            compute_units,
            memory_mb,
        })
    }

    fn apply(&self, quota: ResourceQuota) -> ResourceQuota {
        ResourceQuota {
            compute_units: self.compute_units.unwrap_or(quota.compute_units),
            memory_mb: self.memory_mb.unwrap_or(quota.memory_mb),
        }
    }
}

/// Public view of a virtual device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VDeviceInfo {
    pub id: VDeviceId,
    pub name: String,
    pub device: DeviceIndex,
    pub quota: ResourceQuota,
    pub container_id: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone)]
struct VDeviceRecord {
    quota: ResourceQuota,
    container_id: Option<String>,
    starts: u32,
}

/// Virtual devices of one physical device
#[derive(Debug)]
pub struct VDeviceTable {
    device: DeviceIndex,
    capacity: ResourceQuota,
    max_count: u32,
    records: BTreeMap<VDeviceId, VDeviceRecord>,
}

impl VDeviceTable {
    pub fn new(device: DeviceIndex, capacity: ResourceQuota, max_count: u32) -> Self {
        Self {
            device,
            capacity,
            max_count,
            records: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: VDeviceId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<VDeviceId> {
        self.records.keys().copied().collect()
    }

    pub fn any_running(&self) -> bool {
        self.records.values().any(|record| record.starts > 0)
    }

    /// Virtual devices with outstanding starts and their start counts
    pub fn running(&self) -> Vec<(VDeviceId, u32)> {
        self.records
            .iter()
            .filter(|(_, record)| record.starts > 0)
            .map(|(id, record)| (*id, record.starts))
            .collect()
    }

    fn used(&self, skip: Option<VDeviceId>) -> (u64, u64) {
        self.records
            .iter()
            .filter(|(id, _)| Some(**id) != skip)
            .fold((0, 0), |(cu, mem), (_, record)| {
                (
                    cu.saturating_add(record.quota.compute_units as u64),
                    mem.saturating_add(record.quota.memory_mb),
                )
            })
    }

    /// Compute units and memory not yet promised to a virtual device
    pub fn remaining(&self) -> ResourceQuota {
        let (cu, mem) = self.used(None);
        ResourceQuota {
            compute_units: (self.capacity.compute_units as u64).saturating_sub(cu) as u32,
            memory_mb: self.capacity.memory_mb.saturating_sub(mem),
        }
    }

    fn record(&self, id: VDeviceId) -> Result<&VDeviceRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| Error::vdevice_not_exist(format!("vdevice {}", id)))
    }

    fn record_mut(&mut self, id: VDeviceId) -> Result<&mut VDeviceRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| Error::vdevice_not_exist(format!("vdevice {}", id)))
    }

    pub fn info(&self, id: VDeviceId) -> Result<VDeviceInfo> {
        let record = self.record(id)?;
        Ok(VDeviceInfo {
            id,
            name: format!("vdcu{}", id),
            device: self.device,
            quota: record.quota,
            container_id: record.container_id.clone(),
            running: record.starts > 0,
        })
    }

    pub fn is_running(&self, id: VDeviceId) -> Result<bool> {
        Ok(self.record(id)?.starts > 0)
    }

    /// Check that a batch fits the remaining quota and the per-device limit
    pub fn check_create(&self, quotas: &[ResourceQuota]) -> Result<()> {
        if quotas.is_empty() {
            return Err(Error::invalid_argument("vdevice count must be positive"));
        }
        if let Some(zero) = quotas.iter().position(|q| q.compute_units == 0 || q.memory_mb == 0) {
            return Err(Error::invalid_argument(format!(
                "vdevice {} of the batch has an empty quota",
                zero
            )));
        }

        if self.records.len() + quotas.len() > self.max_count as usize {
            return Err(Error::out_of_resources(format!(
                "device {} holds at most {} vdevices",
                self.device, self.max_count
            )));
        }

        let remaining = self.remaining();
        let (want_cu, want_mem) = total_quota(quotas).ok_or_else(|| {
            Error::out_of_resources(format!(
                "requested quotas overflow; device {} has {} CUs / {} MiB left",
                self.device, remaining.compute_units, remaining.memory_mb
            ))
        })?;
        if want_cu > remaining.compute_units as u64 || want_mem > remaining.memory_mb {
            return Err(Error::out_of_resources(format!(
                "requested {} CUs / {} MiB, device {} has {} CUs / {} MiB left",
                want_cu, want_mem, self.device, remaining.compute_units, remaining.memory_mb
            )));
        }

        Ok(())
    }

    pub fn insert(&mut self, id: VDeviceId, quota: ResourceQuota) {
        self.records.insert(
            id,
            VDeviceRecord {
                quota,
                container_id: None,
                starts: 0,
            },
        );
    }

    /// Resolve an update into the new quota, checking it may be applied
    pub fn check_update(&self, id: VDeviceId, update: QuotaUpdate) -> Result<ResourceQuota> {
        let record = self.record(id)?;
        if record.starts > 0 {
            return Err(Error::device_busy(format!("vdevice {} is running", id)));
        }

        let quota = update.apply(record.quota);
        if quota.compute_units == 0 || quota.memory_mb == 0 {
            return Err(Error::invalid_argument(format!(
                "vdevice {} quota cannot be empty",
                id
            )));
        }

        let (cu, mem) = self.used(Some(id));
        if quota.compute_units as u64 > (self.capacity.compute_units as u64).saturating_sub(cu)
            || quota.memory_mb > self.capacity.memory_mb.saturating_sub(mem)
        {
            return Err(Error::out_of_resources(format!(
                "vdevice {} quota of {} CUs / {} MiB does not fit",
                id, quota.compute_units, quota.memory_mb
            )));
        }

        Ok(quota)
    }

    pub fn set_quota(&mut self, id: VDeviceId, quota: ResourceQuota) -> Result<()> {
        self.record_mut(id)?.quota = quota;
        Ok(())
    }

    /// Check that a virtual device may be destroyed
    pub fn check_destroy(&self, id: VDeviceId) -> Result<()> {
        if self.is_running(id)? {
            return Err(Error::device_busy(format!("vdevice {} is running", id)));
        }
        Ok(())
    }

    pub fn remove(&mut self, id: VDeviceId) -> Result<ResourceQuota> {
        self.records
            .remove(&id)
            .map(|record| record.quota)
            .ok_or_else(|| Error::vdevice_not_exist(format!("vdevice {}", id)))
    }

    pub fn quota(&self, id: VDeviceId) -> Result<ResourceQuota> {
        Ok(self.record(id)?.quota)
    }

    /// Outstanding start count
    pub fn starts(&self, id: VDeviceId) -> Result<u32> {
        Ok(self.record(id)?.starts)
    }

    pub fn set_starts(&mut self, id: VDeviceId, starts: u32) -> Result<()> {
        self.record_mut(id)?.starts = starts;
        Ok(())
    }

    pub fn bind_container(&mut self, id: VDeviceId, container_id: Option<String>) -> Result<()> {
        self.record_mut(id)?.container_id = container_id;
        Ok(())
    }
}

/// Sum of a batch of quotas, `None` on overflow
fn total_quota(quotas: &[ResourceQuota]) -> Option<(u64, u64)> {
    quotas.iter().try_fold((0u64, 0u64), |(cu, mem), quota| {
        Some((
            cu.checked_add(quota.compute_units as u64)?,
            mem.checked_add(quota.memory_mb)?,
        ))
    })
}
