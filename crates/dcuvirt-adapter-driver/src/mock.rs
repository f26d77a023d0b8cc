//! Mock device driver for testing
//!
//! Keeps programmed slices and virtual devices in memory, enforces the same
//! non-overlap and quota rules a real driver would, and lets tests inject
//! failures, attach workloads and force reset-required mode changes.

use crate::driver::{DeviceDriver, VDeviceSpec};
use crate::{DriverError, Result};
use dcuvirt_core::{
    ActivationStatus, ComputeInstanceId, DeviceIndex, DriverBackend, DriverConfig,
    GpuInstanceId, MigMode, PciInfo, PhysicalDeviceInfo, Placement, ResourceQuota, VDeviceId,
    DEFAULT_MEMORY_SLICES,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Driver operations that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    Close,
    Enumerate,
    ProgramGpuInstance,
    ReleaseGpuInstance,
    ProgramComputeInstance,
    ReleaseComputeInstance,
    InstanceInUse,
    SetMigMode,
    ResetDevice,
    CreateVDevices,
    UpdateVDevice,
    DestroyVDevice,
    StartVDevice,
    StopVDevice,
    BusyPercent,
}

#[derive(Debug, Clone, Copy)]
struct MockVDevice {
    device: DeviceIndex,
    quota: ResourceQuota,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    gpu_instances: HashMap<(DeviceIndex, GpuInstanceId), Placement>,
    compute_instances: HashMap<(DeviceIndex, GpuInstanceId, ComputeInstanceId), Placement>,
    in_use: HashSet<(DeviceIndex, GpuInstanceId, Option<ComputeInstanceId>)>,
    modes: HashMap<DeviceIndex, MigMode>,
    pending_modes: HashMap<DeviceIndex, MigMode>,
    vdevices: HashMap<VDeviceId, MockVDevice>,
    device_busy: HashMap<DeviceIndex, u32>,
    vdevice_busy: HashMap<VDeviceId, u32>,
    failures: HashMap<MockOp, DriverError>,
    calls: HashMap<MockOp, u64>,
    reset_required: bool,
}

impl MockState {
    /// Record the call, fire an injected failure, and require an open session
    fn enter(&mut self, op: MockOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        if let Some(err) = self.failures.remove(&op) {
            debug!("Mock driver failing {:?} with injected error: {}", op, err);
            return Err(err);
        }

        if op != MockOp::Open && !self.open {
            return Err(DriverError::SessionClosed(format!("{:?}", op)));
        }

        Ok(())
    }

    fn used_quota(&self, device: DeviceIndex, skip: Option<VDeviceId>) -> (u64, u64) {
        self.vdevices
            .iter()
            .filter(|(id, vdev)| vdev.device == device && Some(**id) != skip)
            .fold((0, 0), |(cu, mem), (_, vdev)| {
                (
                    cu.saturating_add(vdev.quota.compute_units as u64),
                    mem.saturating_add(vdev.quota.memory_mb),
                )
            })
    }

    fn vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<MockVDevice> {
        self.vdevices
            .get(&vdevice)
            .filter(|vdev| vdev.device == device)
            .copied()
            .ok_or_else(|| {
                DriverError::DeviceNotFound(format!("vdevice {} on device {}", vdevice, device))
            })
    }
}

/// In-memory driver
pub struct MockDriver {
    devices: Vec<PhysicalDeviceInfo>,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// Create a mock driver serving the given devices
    pub fn new(devices: Vec<PhysicalDeviceInfo>) -> Self {
        info!("Creating mock device driver with {} devices", devices.len());
        Self {
            devices,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Create a mock driver from the `mock_devices` configuration
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        if config.mock_devices.is_empty() {
            return Err(DriverError::InitializationFailed(
                "no mock devices configured".to_string(),
            ));
        }

        let devices = config
            .mock_devices
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let mut info = Self::device_info(
                    i as u32,
                    shape.compute_units,
                    shape.memory_mb,
                    shape.memory_slices,
                );
                info.name = shape.name.clone();
                info.mig_capable = shape.mig_capable;
                info.virtualization_capable = shape.virtualization_capable;
                info.uuid = shape
                    .uuid
                    .clone()
                    .unwrap_or_else(|| format!("GPU-{}", uuid::Uuid::new_v4()));
                info
            })
            .collect();

        Ok(Self::new(devices))
    }

    /// Build a capable device description with deterministic identity
    pub fn device_info(
        index: u32,
        compute_units: u32,
        memory_mb: u64,
        memory_slices: u32,
    ) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            index: DeviceIndex(index),
            name: format!("Mock DCU {}", index),
            uuid: format!("GPU-{:08x}-0000-4000-8000-{:012x}", 0x6d6f636b, index),
            serial: format!("MOCK{:08}", index),
            pci: PciInfo::new(0, 0x3b_u8.wrapping_add(index as u8), 0, 0),
            compute_units,
            memory_mb,
            memory_slices: if memory_slices == 0 {
                DEFAULT_MEMORY_SLICES
            } else {
                memory_slices
            },
            mig_capable: true,
            virtualization_capable: true,
        }
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: MockOp, err: DriverError) {
        self.state.lock().failures.insert(op, err);
    }

    /// Number of times `op` has been called
    pub fn call_count(&self, op: MockOp) -> u64 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Attach or detach an external workload on a GPU or compute instance
    pub fn set_in_use(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: Option<ComputeInstanceId>,
        in_use: bool,
    ) {
        let mut state = self.state.lock();
        let key = (device, gpu_instance, compute_instance);
        if in_use {
            state.in_use.insert(key);
        } else {
            state.in_use.remove(&key);
        }
    }

    /// Make subsequent mode changes report `ResetRequired`
    pub fn require_reset(&self, required: bool) {
        self.state.lock().reset_required = required;
    }

    pub fn set_device_busy_percent(&self, device: DeviceIndex, percent: u32) {
        self.state.lock().device_busy.insert(device, percent.min(100));
    }

    pub fn set_vdevice_busy_percent(&self, vdevice: VDeviceId, percent: u32) {
        self.state.lock().vdevice_busy.insert(vdevice, percent.min(100));
    }

    /// Placements programmed for GPU instances of a device, sorted by start
    pub fn programmed_gpu_instances(&self, device: DeviceIndex) -> Vec<Placement> {
        let state = self.state.lock();
        let mut placements: Vec<Placement> = state
            .gpu_instances
            .iter()
            .filter(|((d, _), _)| *d == device)
            .map(|(_, placement)| *placement)
            .collect();
        placements.sort();
        placements
    }

    /// Number of compute instances programmed on a device
    pub fn programmed_compute_instance_count(&self, device: DeviceIndex) -> usize {
        self.state
            .lock()
            .compute_instances
            .keys()
            .filter(|(d, _, _)| *d == device)
            .count()
    }

    /// Running flag of a virtual device, `None` if it does not exist
    pub fn vdevice_running(&self, vdevice: VDeviceId) -> Option<bool> {
        self.state.lock().vdevices.get(&vdevice).map(|v| v.running)
    }

    /// Number of virtual devices known to the driver
    pub fn vdevice_total(&self) -> usize {
        self.state.lock().vdevices.len()
    }

    fn device(&self, device: DeviceIndex) -> Result<&PhysicalDeviceInfo> {
        self.devices
            .iter()
            .find(|info| info.index == device)
            .ok_or_else(|| DriverError::DeviceNotFound(format!("device {}", device)))
    }
}

impl DeviceDriver for MockDriver {
    fn backend(&self) -> DriverBackend {
        DriverBackend::Mock
    }

    fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::Open)?;
        state.open = true;
        debug!("Mock driver session opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::Close)?;
        state.open = false;
        debug!("Mock driver session closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn enumerate_devices(&self) -> Result<Vec<PhysicalDeviceInfo>> {
        self.state.lock().enter(MockOp::Enumerate)?;
        Ok(self.devices.clone())
    }

    fn program_gpu_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        placement: Placement,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ProgramGpuInstance)?;
        let info = self.device(device)?;

        if !state.modes.get(&device).copied().unwrap_or_default().is_enabled() {
            return Err(DriverError::NotSupported(format!(
                "MIG mode disabled on device {}",
                device
            )));
        }
        if !placement.fits_within(info.memory_slices) {
            return Err(DriverError::InvalidArgument(format!(
                "placement {} outside device {}",
                placement, device
            )));
        }
        if state.gpu_instances.contains_key(&(device, gpu_instance)) {
            return Err(DriverError::InvalidArgument(format!(
                "gpu instance {} already programmed",
                gpu_instance
            )));
        }
        let conflict = state
            .gpu_instances
            .iter()
            .any(|((d, _), existing)| *d == device && existing.overlaps(&placement));
        if conflict {
            return Err(DriverError::SliceConflict(format!(
                "placement {} on device {}",
                placement, device
            )));
        }

        state.gpu_instances.insert((device, gpu_instance), placement);
        Ok(())
    }

    fn release_gpu_instance(&self, device: DeviceIndex, gpu_instance: GpuInstanceId) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ReleaseGpuInstance)?;

        let has_children = state
            .compute_instances
            .keys()
            .any(|(d, gi, _)| *d == device && *gi == gpu_instance);
        if has_children {
            return Err(DriverError::Busy(format!(
                "gpu instance {} still has compute instances",
                gpu_instance
            )));
        }

        state
            .gpu_instances
            .remove(&(device, gpu_instance))
            .map(|_| ())
            .ok_or_else(|| DriverError::DeviceNotFound(format!("gpu instance {}", gpu_instance)))
    }

    fn program_compute_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
        placement: Placement,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ProgramComputeInstance)?;

        let parent = state
            .gpu_instances
            .get(&(device, gpu_instance))
            .copied()
            .ok_or_else(|| DriverError::DeviceNotFound(format!("gpu instance {}", gpu_instance)))?;

        if !placement.fits_within(parent.size) {
            return Err(DriverError::InvalidArgument(format!(
                "placement {} outside gpu instance {}",
                placement, gpu_instance
            )));
        }
        let key = (device, gpu_instance, compute_instance);
        if state.compute_instances.contains_key(&key) {
            return Err(DriverError::InvalidArgument(format!(
                "compute instance {} already programmed",
                compute_instance
            )));
        }
        let conflict = state.compute_instances.iter().any(|((d, gi, _), existing)| {
            *d == device && *gi == gpu_instance && existing.overlaps(&placement)
        });
        if conflict {
            return Err(DriverError::SliceConflict(format!(
                "placement {} in gpu instance {}",
                placement, gpu_instance
            )));
        }

        state.compute_instances.insert(key, placement);
        Ok(())
    }

    fn release_compute_instance(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: ComputeInstanceId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ReleaseComputeInstance)?;

        state
            .compute_instances
            .remove(&(device, gpu_instance, compute_instance))
            .map(|_| ())
            .ok_or_else(|| {
                DriverError::DeviceNotFound(format!("compute instance {}", compute_instance))
            })
    }

    fn instance_in_use(
        &self,
        device: DeviceIndex,
        gpu_instance: GpuInstanceId,
        compute_instance: Option<ComputeInstanceId>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        state.enter(MockOp::InstanceInUse)?;
        Ok(state.in_use.contains(&(device, gpu_instance, compute_instance)))
    }

    fn set_mig_mode(&self, device: DeviceIndex, mode: MigMode) -> Result<ActivationStatus> {
        let mut state = self.state.lock();
        state.enter(MockOp::SetMigMode)?;
        let info = self.device(device)?;

        if !info.mig_capable {
            return Err(DriverError::NotSupported(format!(
                "device {} cannot be partitioned",
                device
            )));
        }

        if !mode.is_enabled() && state.gpu_instances.keys().any(|(d, _)| *d == device) {
            return Err(DriverError::Busy(format!(
                "device {} still has gpu instances",
                device
            )));
        }

        if state.reset_required {
            state.pending_modes.insert(device, mode);
            return Ok(ActivationStatus::ResetRequired);
        }

        state.pending_modes.remove(&device);
        state.modes.insert(device, mode);
        Ok(ActivationStatus::Activated)
    }

    fn reset_device(&self, device: DeviceIndex) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::ResetDevice)?;
        self.device(device)?;

        state.gpu_instances.retain(|(d, _), _| *d != device);
        state.compute_instances.retain(|(d, _, _), _| *d != device);
        state.in_use.retain(|(d, _, _)| *d != device);
        if let Some(mode) = state.pending_modes.remove(&device) {
            state.modes.insert(device, mode);
        }
        Ok(())
    }

    fn create_vdevices(&self, device: DeviceIndex, specs: &[VDeviceSpec]) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::CreateVDevices)?;
        let info = self.device(device)?;

        if !info.virtualization_capable {
            return Err(DriverError::NotSupported(format!(
                "device {} has no virtualization support",
                device
            )));
        }

        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.id) || state.vdevices.contains_key(&spec.id) {
                return Err(DriverError::InvalidArgument(format!(
                    "vdevice {} already exists",
                    spec.id
                )));
            }
        }

        let (used_cu, used_mem) = state.used_quota(device, None);
        let (want_cu, want_mem) = specs.iter().fold((used_cu, used_mem), |(cu, mem), s| {
            (
                cu.saturating_add(s.quota.compute_units as u64),
                mem.saturating_add(s.quota.memory_mb),
            )
        });
        if want_cu > info.compute_units as u64 || want_mem > info.memory_mb {
            return Err(DriverError::ResourceExhausted(format!(
                "device {} cannot fit {} more vdevices",
                device,
                specs.len()
            )));
        }

        for spec in specs {
            state.vdevices.insert(
                spec.id,
                MockVDevice {
                    device,
                    quota: spec.quota,
                    running: false,
                },
            );
        }
        Ok(())
    }

    fn update_vdevice(
        &self,
        device: DeviceIndex,
        vdevice: VDeviceId,
        quota: ResourceQuota,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::UpdateVDevice)?;
        let info = self.device(device)?;
        let current = state.vdevice(device, vdevice)?;

        if current.running {
            return Err(DriverError::Busy(format!("vdevice {} is running", vdevice)));
        }

        let (used_cu, used_mem) = state.used_quota(device, Some(vdevice));
        if used_cu.saturating_add(quota.compute_units as u64) > info.compute_units as u64
            || used_mem.saturating_add(quota.memory_mb) > info.memory_mb
        {
            return Err(DriverError::ResourceExhausted(format!(
                "vdevice {} quota does not fit",
                vdevice
            )));
        }

        if let Some(vdev) = state.vdevices.get_mut(&vdevice) {
            vdev.quota = quota;
        }
        Ok(())
    }

    fn destroy_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::DestroyVDevice)?;

        if state.vdevice(device, vdevice)?.running {
            return Err(DriverError::Busy(format!("vdevice {} is running", vdevice)));
        }
        state.vdevices.remove(&vdevice);
        state.vdevice_busy.remove(&vdevice);
        Ok(())
    }

    fn start_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::StartVDevice)?;

        if state.vdevice(device, vdevice)?.running {
            return Err(DriverError::Busy(format!("vdevice {} already running", vdevice)));
        }
        if let Some(vdev) = state.vdevices.get_mut(&vdevice) {
            vdev.running = true;
        }
        Ok(())
    }

    fn stop_vdevice(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(MockOp::StopVDevice)?;

        if !state.vdevice(device, vdevice)?.running {
            return Err(DriverError::InvalidArgument(format!(
                "vdevice {} is not running",
                vdevice
            )));
        }
        if let Some(vdev) = state.vdevices.get_mut(&vdevice) {
            vdev.running = false;
        }
        Ok(())
    }

    fn device_busy_percent(&self, device: DeviceIndex) -> Result<u32> {
        let mut state = self.state.lock();
        state.enter(MockOp::BusyPercent)?;
        self.device(device)?;
        Ok(state.device_busy.get(&device).copied().unwrap_or(0))
    }

    fn vdevice_busy_percent(&self, device: DeviceIndex, vdevice: VDeviceId) -> Result<u32> {
        let mut state = self.state.lock();
        state.enter(MockOp::BusyPercent)?;
        state.vdevice(device, vdevice)?;
        Ok(state.vdevice_busy.get(&vdevice).copied().unwrap_or(0))
    }
}
