//! Slice occupancy map
//!
//! One bit per slice in a `u64`. Used at device level for memory slices and
//! inside each GPU instance for compute slices.

use dcuvirt_core::{Error, Placement, Result, MAX_SLICES};

/// Occupied slices of a `[0, total)` range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceOccupancy {
    total: u32,
    mask: u64,
}

fn placement_mask(placement: Placement) -> u64 {
    let bits = if placement.size >= 64 {
        u64::MAX
    } else {
        (1u64 << placement.size) - 1
    };
    bits << placement.start
}

impl SliceOccupancy {
    pub fn new(total: u32) -> Result<Self> {
        if total == 0 || total > MAX_SLICES {
            return Err(Error::invalid_argument(format!(
                "slice range of {} is outside 1..={}",
                total, MAX_SLICES
            )));
        }
        Ok(Self { total, mask: 0 })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn used(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Whether `placement` is in range and touches no occupied slice
    pub fn is_free(&self, placement: Placement) -> bool {
        placement.fits_within(self.total) && self.mask & placement_mask(placement) == 0
    }

    /// Claim the slices of `placement`
    pub fn reserve(&mut self, placement: Placement) -> Result<()> {
        if !placement.fits_within(self.total) {
            return Err(Error::invalid_argument(format!(
                "placement {} outside slice range of {}",
                placement, self.total
            )));
        }

        let bits = placement_mask(placement);
        if self.mask & bits != 0 {
            return Err(Error::insufficient_resources(format!(
                "placement {} overlaps occupied slices",
                placement
            )));
        }

        self.mask |= bits;
        Ok(())
    }

    /// Free the slices of `placement`; returns false if any was not held
    pub fn release(&mut self, placement: Placement) -> bool {
        if !placement.fits_within(self.total) {
            return false;
        }
        let bits = placement_mask(placement);
        let held = self.mask & bits == bits;
        self.mask &= !bits;
        held
    }

    pub fn clear(&mut self) {
        self.mask = 0;
    }

    /// Maximal runs of free slices, in ascending order
    pub fn free_runs(&self) -> Vec<Placement> {
        let mut runs = Vec::new();
        let mut start = None;

        for slice in 0..self.total {
            let free = self.mask & (1u64 << slice) == 0;
            match (free, start) {
                (true, None) => start = Some(slice),
                (false, Some(s)) => {
                    runs.push(Placement::new(s, slice - s));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(Placement::new(s, self.total - s));
        }

        runs
    }

    /// Number of additional non-overlapping placements of `size` that still fit
    pub fn remaining_capacity(&self, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        self.free_runs().iter().map(|run| run.size / size).sum()
    }

    /// Lowest-start free placement of `size`
    pub fn first_fit(&self, size: u32) -> Option<Placement> {
        if size == 0 || size > self.total {
            return None;
        }
        (0..=self.total - size)
            .map(|start| Placement::new(start, size))
            .find(|placement| self.is_free(*placement))
    }
}
