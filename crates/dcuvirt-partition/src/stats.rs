//! Manager statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the manager
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub gpu_instances_created: AtomicU64,
    pub gpu_instances_destroyed: AtomicU64,
    pub compute_instances_created: AtomicU64,
    pub compute_instances_destroyed: AtomicU64,
    /// Creates refused because no conflict-free placement was left
    pub placement_conflicts: AtomicU64,
    pub vdevices_created: AtomicU64,
    pub vdevices_destroyed: AtomicU64,
    /// Mutating calls that returned an error
    pub rejected_mutations: AtomicU64,
    /// Driver calls that failed
    pub driver_failures: AtomicU64,
}

/// Point-in-time copy of [`ManagerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub gpu_instances_created: u64,
    pub gpu_instances_destroyed: u64,
    pub compute_instances_created: u64,
    pub compute_instances_destroyed: u64,
    pub placement_conflicts: u64,
    pub vdevices_created: u64,
    pub vdevices_destroyed: u64,
    pub rejected_mutations: u64,
    pub driver_failures: u64,
}

impl ManagerStats {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gpu_instances_created: self.gpu_instances_created.load(Ordering::Relaxed),
            gpu_instances_destroyed: self.gpu_instances_destroyed.load(Ordering::Relaxed),
            compute_instances_created: self.compute_instances_created.load(Ordering::Relaxed),
            compute_instances_destroyed: self.compute_instances_destroyed.load(Ordering::Relaxed),
            placement_conflicts: self.placement_conflicts.load(Ordering::Relaxed),
            vdevices_created: self.vdevices_created.load(Ordering::Relaxed),
            vdevices_destroyed: self.vdevices_destroyed.load(Ordering::Relaxed),
            rejected_mutations: self.rejected_mutations.load(Ordering::Relaxed),
            driver_failures: self.driver_failures.load(Ordering::Relaxed),
        }
    }
}
