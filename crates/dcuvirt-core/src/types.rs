//! Core type definitions for dcuvirt

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of memory slices a physical device is divided into
pub const DEFAULT_MEMORY_SLICES: u32 = 8;

/// Upper bound on slices per range; occupancy is tracked in a u64 mask
pub const MAX_SLICES: u32 = 64;

macro_rules! index_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Get the raw numeric value
            pub fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

index_newtype!(
    /// Index of a physical device as enumerated by the driver
    DeviceIndex
);
index_newtype!(
    /// GPU instance ID, unique per device and never reused
    GpuInstanceId
);
index_newtype!(
    /// Compute instance ID, unique per parent GPU instance
    ComputeInstanceId
);
index_newtype!(
    /// Virtual device ID, unique across the context
    VDeviceId
);

/// Contiguous interval of slices claimed by an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub start: u32,
    pub size: u32,
}

impl Placement {
    pub fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// One past the last slice covered
    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    /// Two placements conflict iff their intervals overlap
    pub fn overlaps(&self, other: &Placement) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Check that the placement is non-empty and lies within `[0, total)`
    pub fn fits_within(&self, total: u32) -> bool {
        self.size > 0 && self.start.checked_add(self.size).map_or(false, |end| end <= total)
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{start: {}, size: {}}}", self.start, self.size)
    }
}

/// Multi-instance partitioning mode of a device or of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigMode {
    #[default]
    Disabled,
    Enabled,
}

impl MigMode {
    pub fn is_enabled(self) -> bool {
        self == MigMode::Enabled
    }
}

impl fmt::Display for MigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigMode::Disabled => write!(f, "disabled"),
            MigMode::Enabled => write!(f, "enabled"),
        }
    }
}

/// Current and pending mode of a device
///
/// `pending` differs from `current` only while a mode change waits for a
/// device reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigModeState {
    pub current: MigMode,
    pub pending: MigMode,
}

impl MigModeState {
    pub fn settled(mode: MigMode) -> Self {
        Self {
            current: mode,
            pending: mode,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current != self.pending
    }
}

/// Outcome of a mode change reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationStatus {
    /// The new mode is in effect
    Activated,
    /// The new mode takes effect after the device is reset
    ResetRequired,
}

/// PCI location of a physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciInfo {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// Canonical `dddddddd:bb:dd.f` form
    pub bus_id: String,
}

impl PciInfo {
    pub fn new(domain: u32, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
            bus_id: format!("{:08x}:{:02x}:{:02x}.{:x}", domain, bus, device, function),
        }
    }

    /// Compare against a caller-supplied bus id, ignoring case and a short domain
    pub fn matches_bus_id(&self, bus_id: &str) -> bool {
        let wanted = bus_id.trim().to_ascii_lowercase();
        if wanted == self.bus_id {
            return true;
        }
        let short = format!("{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.device, self.function);
        wanted == short
    }
}

/// Static identity and capacity of a physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDeviceInfo {
    pub index: DeviceIndex,
    pub name: String,
    pub uuid: String,
    pub serial: String,
    pub pci: PciInfo,
    /// Total compute units
    pub compute_units: u32,
    /// Total memory in MiB
    pub memory_mb: u64,
    /// Number of memory slices the device is divided into
    pub memory_slices: u32,
    /// Device can be partitioned into GPU/compute instances
    pub mig_capable: bool,
    /// Device can host legacy virtual devices
    pub virtualization_capable: bool,
}

/// Attributes reported for a physical device or a MIG device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub index: u32,
    pub compute_units: u32,
    pub memory_mb: u64,
    pub uuid: String,
    pub name: String,
    /// Memory slices held; zero for a whole physical device
    pub gpu_instance_slice_count: u32,
    /// Compute slices held; zero for a whole physical device
    pub compute_instance_slice_count: u32,
}

/// Compute units and memory not yet promised to virtual devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub compute_units: u32,
    pub memory_mb: u64,
}

impl ResourceQuota {
    pub fn new(compute_units: u32, memory_mb: u64) -> Self {
        Self {
            compute_units,
            memory_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_overlap() {
        let a = Placement::new(0, 4);
        let b = Placement::new(4, 4);
        let c = Placement::new(3, 2);

        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn test_placement_bounds() {
        assert!(Placement::new(4, 4).fits_within(8));
        assert!(!Placement::new(5, 4).fits_within(8));
        assert!(!Placement::new(0, 0).fits_within(8));
        assert!(!Placement::new(u32::MAX, 2).fits_within(8));
    }

    #[test]
    fn test_pci_bus_id() {
        let pci = PciInfo::new(0, 0x3b, 0, 0);
        assert_eq!(pci.bus_id, "00000000:3b:00.0");
        assert!(pci.matches_bus_id("00000000:3B:00.0"));
        assert!(pci.matches_bus_id("0000:3b:00.0"));
        assert!(!pci.matches_bus_id("0000:3c:00.0"));
    }

    #[test]
    fn test_mode_state() {
        let mut state = MigModeState::settled(MigMode::Disabled);
        assert!(!state.is_pending());
        state.pending = MigMode::Enabled;
        assert!(state.is_pending());
        assert_eq!(state.pending.to_string(), "enabled");
    }

    #[test]
    fn test_mig_mode_serialization() {
        let json = serde_json::to_string(&MigMode::Enabled).unwrap();
        assert_eq!(json, "\"enabled\"");
        let mode: MigMode = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(mode, MigMode::Disabled);
    }
}
