//! MIG mode arbitration
//!
//! Pure policy: decides whether a device or system mode change may proceed
//! and what state results. The manager performs the driver call in between.
//!
//! Rules:
//! - the system mode gates per-device enabling
//! - a device with live GPU instances cannot be disabled
//! - a device hosting virtual devices cannot be enabled
//! - the system cannot be disabled while any device is enabled or pending enabled

use dcuvirt_core::{ActivationStatus, Error, MigMode, MigModeState, PhysicalDeviceInfo, Result};

/// What a requested device mode change amounts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTransition {
    /// Already in (or already pending to) the requested mode
    Unchanged(ActivationStatus),
    /// The driver must be asked to switch
    Switch,
}

/// Facts about a device the arbitration needs
#[derive(Debug, Clone, Copy)]
pub struct DeviceModeView<'a> {
    pub info: &'a PhysicalDeviceInfo,
    pub state: MigModeState,
    pub has_instances: bool,
    pub has_vdevices: bool,
}

/// Decide a per-device mode change
pub fn check_device_transition(
    system: MigMode,
    device: DeviceModeView<'_>,
    target: MigMode,
) -> Result<ModeTransition> {
    if !device.info.mig_capable {
        return Err(Error::not_supported(format!(
            "device {} does not support MIG",
            device.info.index
        )));
    }

    match target {
        MigMode::Enabled => {
            if !system.is_enabled() {
                return Err(Error::not_supported(format!(
                    "MIG is disabled system-wide; cannot enable device {}",
                    device.info.index
                )));
            }
            if device.has_vdevices {
                return Err(Error::in_use(format!(
                    "device {} hosts virtual devices",
                    device.info.index
                )));
            }
        }
        MigMode::Disabled => {
            if device.has_instances {
                return Err(Error::in_use(format!(
                    "device {} has live gpu instances",
                    device.info.index
                )));
            }
        }
    }

    if device.state.pending == target {
        let status = if device.state.current == target {
            ActivationStatus::Activated
        } else {
            ActivationStatus::ResetRequired
        };
        return Ok(ModeTransition::Unchanged(status));
    }

    Ok(ModeTransition::Switch)
}

/// State after the driver accepted a switch
pub fn apply_activation(state: MigModeState, target: MigMode, status: ActivationStatus) -> MigModeState {
    match status {
        ActivationStatus::Activated => MigModeState::settled(target),
        ActivationStatus::ResetRequired => MigModeState {
            current: state.current,
            pending: target,
        },
    }
}

/// Decide a system mode change given every device's state
pub fn check_system_transition<'a, I>(target: MigMode, devices: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a PhysicalDeviceInfo, MigModeState)>,
{
    let mut any_capable = false;

    for (info, state) in devices {
        any_capable |= info.mig_capable;

        if !target.is_enabled() && (state.current.is_enabled() || state.pending.is_enabled()) {
            return Err(Error::in_use(format!(
                "device {} is still MIG-enabled",
                info.index
            )));
        }
    }

    if !any_capable {
        return Err(Error::not_supported("no MIG-capable device present"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcuvirt_core::{DeviceIndex, PciInfo, StatusCode};

    fn info(capable: bool) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            index: DeviceIndex(0),
            name: "DCU".to_string(),
            uuid: "GPU-0".to_string(),
            serial: "0".to_string(),
            pci: PciInfo::new(0, 1, 0, 0),
            compute_units: 64,
            memory_mb: 32768,
            memory_slices: 8,
            mig_capable: capable,
            virtualization_capable: true,
        }
    }

    fn view(info: &PhysicalDeviceInfo, state: MigModeState) -> DeviceModeView<'_> {
        DeviceModeView {
            info,
            state,
            has_instances: false,
            has_vdevices: false,
        }
    }

    #[test]
    fn test_enable_requires_system_mode() {
        let dev = info(true);
        let state = MigModeState::settled(MigMode::Disabled);

        let err = check_device_transition(MigMode::Disabled, view(&dev, state), MigMode::Enabled)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NotSupported);

        let ok = check_device_transition(MigMode::Enabled, view(&dev, state), MigMode::Enabled);
        assert_eq!(ok.unwrap(), ModeTransition::Switch);
    }

    #[test]
    fn test_disable_with_instances_in_use() {
        let dev = info(true);
        let mut v = view(&dev, MigModeState::settled(MigMode::Enabled));
        v.has_instances = true;

        let err = check_device_transition(MigMode::Enabled, v, MigMode::Disabled).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
    }

    #[test]
    fn test_enable_with_vdevices_in_use() {
        let dev = info(true);
        let mut v = view(&dev, MigModeState::settled(MigMode::Disabled));
        v.has_vdevices = true;

        let err = check_device_transition(MigMode::Enabled, v, MigMode::Enabled).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
    }

    #[test]
    fn test_repeat_request_is_unchanged() {
        let dev = info(true);
        let settled = view(&dev, MigModeState::settled(MigMode::Enabled));
        assert_eq!(
            check_device_transition(MigMode::Enabled, settled, MigMode::Enabled).unwrap(),
            ModeTransition::Unchanged(ActivationStatus::Activated)
        );

        let pending = view(
            &dev,
            MigModeState {
                current: MigMode::Disabled,
                pending: MigMode::Enabled,
            },
        );
        assert_eq!(
            check_device_transition(MigMode::Enabled, pending, MigMode::Enabled).unwrap(),
            ModeTransition::Unchanged(ActivationStatus::ResetRequired)
        );
    }

    #[test]
    fn test_apply_activation() {
        let state = MigModeState::settled(MigMode::Disabled);
        let pending = apply_activation(state, MigMode::Enabled, ActivationStatus::ResetRequired);
        assert_eq!(pending.current, MigMode::Disabled);
        assert_eq!(pending.pending, MigMode::Enabled);

        let done = apply_activation(state, MigMode::Enabled, ActivationStatus::Activated);
        assert_eq!(done, MigModeState::settled(MigMode::Enabled));
    }

    #[test]
    fn test_system_transition() {
        let capable = info(true);
        let enabled = MigModeState::settled(MigMode::Enabled);
        let disabled = MigModeState::settled(MigMode::Disabled);

        let err = check_system_transition(MigMode::Disabled, [(&capable, enabled)]).unwrap_err();
        assert_eq!(err.status(), StatusCode::InUse);
        assert!(check_system_transition(MigMode::Disabled, [(&capable, disabled)]).is_ok());

        let incapable = info(false);
        let err = check_system_transition(MigMode::Enabled, [(&incapable, disabled)]).unwrap_err();
        assert_eq!(err.status(), StatusCode::NotSupported);
    }

    #[test]
    fn test_incapable_device_rejected() {
        let dev = info(false);
        let err = check_device_transition(
            MigMode::Enabled,
            view(&dev, MigModeState::default()),
            MigMode::Enabled,
        )
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NotSupported);
    }
}
