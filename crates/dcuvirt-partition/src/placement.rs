//! Placement enumeration
//!
//! Candidates depend only on the range size and the profile size, never on
//! occupancy; the occupancy map rejects conflicts at commit time.

use dcuvirt_core::{Error, Placement, Result};

/// Number of candidate placements of `size` slices in a range of `total`
pub fn placement_count(total: u32, size: u32) -> u32 {
    if size == 0 || size > total {
        return 0;
    }
    total - size + 1
}

/// All candidate placements, ordered by start
pub fn possible_placements(total: u32, size: u32) -> Vec<Placement> {
    (0..placement_count(total, size))
        .map(|start| Placement::new(start, size))
        .collect()
}

/// Write candidates into a caller buffer and return how many were written
pub fn possible_placements_into(total: u32, size: u32, buf: &mut [Placement]) -> Result<usize> {
    let count = placement_count(total, size) as usize;
    if buf.len() < count {
        return Err(Error::insufficient_size(format!(
            "{} placements do not fit a buffer of {}",
            count,
            buf.len()
        )));
    }

    for (start, slot) in buf.iter_mut().take(count).enumerate() {
        *slot = Placement::new(start as u32, size);
    }
    Ok(count)
}

/// Check that `placement` is one of the candidates for `size`
pub fn validate_placement(total: u32, size: u32, placement: Placement) -> Result<()> {
    if placement.size != size || !placement.fits_within(total) {
        return Err(Error::invalid_argument(format!(
            "placement {} is not valid for a {}-slice profile in {} slices",
            placement, size, total
        )));
    }
    Ok(())
}
