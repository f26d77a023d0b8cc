//! Device and system MIG mode operations

use super::DeviceManager;
use crate::mode::{apply_activation, check_device_transition, check_system_transition, ModeTransition};
use crate::stats::ManagerStats;
use dcuvirt_core::{ActivationStatus, DeviceIndex, Error, MigMode, MigModeState, Result};
use tracing::info;

impl DeviceManager {
    /// Current and pending MIG mode of a device
    pub fn mig_mode(&self, device: DeviceIndex) -> Result<MigModeState> {
        Ok(self.read_device(device)?.mode)
    }

    /// Request a per-device MIG mode change
    pub fn set_mig_mode(&self, device: DeviceIndex, mode: MigMode) -> Result<ActivationStatus> {
        let result = self.set_mig_mode_inner(device, mode);
        self.reject("set_mig_mode", result)
    }

    fn set_mig_mode_inner(&self, device: DeviceIndex, mode: MigMode) -> Result<ActivationStatus> {
        let system = self.system_mode.read();
        let mut state = self.write_device(device)?;
        let info = self.info(device)?;

        match check_device_transition(*system, state.mode_view(info), mode)? {
            ModeTransition::Unchanged(status) => Ok(status),
            ModeTransition::Switch => {
                let status = self.driver_call(self.driver.set_mig_mode(device, mode))?;
                state.mode = apply_activation(state.mode, mode, status);
                info!(
                    "MIG mode of device {} set to {} ({:?})",
                    device, mode, status
                );
                Ok(status)
            }
        }
    }

    pub fn system_mig_mode(&self) -> Result<MigMode> {
        let mode = *self.system_mode.read();
        self.ensure_initialized()?;
        Ok(mode)
    }

    /// Gate per-device MIG enabling for the whole system
    pub fn set_system_mig_mode(&self, mode: MigMode) -> Result<()> {
        let result = self.set_system_mig_mode_inner(mode);
        self.reject("set_system_mig_mode", result)
    }

    fn set_system_mig_mode_inner(&self, mode: MigMode) -> Result<()> {
        let mut system = self.system_mode.write();
        let guards: Vec<_> = self.devices.iter().map(|device| device.read()).collect();
        self.ensure_initialized()?;

        if *system == mode {
            return Ok(());
        }

        check_system_transition(
            mode,
            self.infos
                .iter()
                .zip(guards.iter())
                .map(|(info, state)| (info, state.mode)),
        )?;

        *system = mode;
        info!("System MIG mode set to {}", mode);
        Ok(())
    }

    /// Reset a device: every GPU and compute instance is dropped and a
    /// pending mode change takes effect
    pub fn reset_device(&self, device: DeviceIndex) -> Result<()> {
        let result = self.reset_device_inner(device);
        self.reject("reset_device", result)
    }

    fn reset_device_inner(&self, device: DeviceIndex) -> Result<()> {
        let mut state = self.write_device(device)?;

        if state.vdevices.any_running() {
            return Err(Error::device_busy(format!(
                "device {} has running virtual devices",
                device
            )));
        }

        self.driver_call(self.driver.reset_device(device))?;

        let gpu_instances = state.mig.gpu_instance_count() as u64;
        let compute_instances: u64 = state
            .mig
            .gpu_instances()
            .iter()
            .map(|(_, record)| record.compute_instance_count() as u64)
            .sum();
        state.mig.reset();
        state.mode = MigModeState::settled(state.mode.pending);

        ManagerStats::bump(&self.stats.gpu_instances_destroyed, gpu_instances);
        ManagerStats::bump(&self.stats.compute_instances_destroyed, compute_instances);
        info!(
            "Reset device {}: dropped {} gpu instances, MIG mode now {}",
            device, gpu_instances, state.mode.current
        );
        Ok(())
    }
}
