//! Mutable per-device state guarded by the manager's per-device lock

use crate::mode::DeviceModeView;
use crate::registry::MigRegistry;
use crate::vdevice::VDeviceTable;
use dcuvirt_core::{Error, MigModeState, PhysicalDeviceInfo, ResourceQuota, Result};

#[derive(Debug)]
pub(crate) struct DeviceState {
    pub mode: MigModeState,
    pub mig: MigRegistry,
    pub vdevices: VDeviceTable,
}

impl DeviceState {
    pub fn new(info: &PhysicalDeviceInfo, max_vdevices: u32) -> Result<Self> {
        Ok(Self {
            mode: MigModeState::default(),
            mig: MigRegistry::new(info.memory_slices)?,
            vdevices: VDeviceTable::new(
                info.index,
                ResourceQuota::new(info.compute_units, info.memory_mb),
                max_vdevices,
            ),
        })
    }

    pub fn mode_view<'a>(&self, info: &'a PhysicalDeviceInfo) -> DeviceModeView<'a> {
        DeviceModeView {
            info,
            state: self.mode,
            has_instances: self.mig.has_instances(),
            has_vdevices: !self.vdevices.is_empty(),
        }
    }

    /// MIG operations need the mode to be in effect, not merely pending
    pub fn ensure_mig_enabled(&self, info: &PhysicalDeviceInfo) -> Result<()> {
        if !info.mig_capable || !self.mode.current.is_enabled() {
            return Err(Error::not_supported(format!(
                "MIG mode is not enabled on device {}",
                info.index
            )));
        }
        Ok(())
    }
}
