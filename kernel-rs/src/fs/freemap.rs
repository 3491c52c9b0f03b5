//! The free-sector bitmap. Grounded in
//! `examples/original_source/src/filesys/free-map.c`: a single lock, a
//! bitmap, `allocate`/`release`/open-close-at-boot.
//!
//! spec.md §9's Open Questions flags the original `free_map_allocate`
//! rollback loop as using a signed decreasing index prone to underflow; this
//! rolls back by iterating the already-granted slice instead.

use std::sync::Mutex;

use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// A bitmap over every sector on the device. Bits for the free-map file's
/// own sector and the root directory's sector are permanently set.
pub struct FreeMap {
    bits: Mutex<Vec<bool>>,
}

impl FreeMap {
    /// Creates a fresh free map for a device of `num_sectors` sectors, with
    /// the two reserved sectors already marked in-use.
    pub fn format(num_sectors: u32) -> Self {
        let mut bits = vec![false; num_sectors as usize];
        bits[FREE_MAP_SECTOR as usize] = true;
        bits[ROOT_DIR_SECTOR as usize] = true;
        Self {
            bits: Mutex::new(bits),
        }
    }

    /// Reconstructs a free map from a previously persisted bit vector (read
    /// from the free-map file's inode data).
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self {
            bits: Mutex::new(bits),
        }
    }

    pub fn to_bits(&self) -> Vec<bool> {
        self.bits.lock().expect("free map lock poisoned").clone()
    }

    pub fn num_sectors(&self) -> u32 {
        self.bits.lock().expect("free map lock poisoned").len() as u32
    }

    /// Scans for `count` *not-necessarily-consecutive* free sectors,
    /// flipping bits as it finds them. On partial failure, every sector
    /// already granted in this call is rolled back and `None` is returned.
    pub fn allocate(&self, count: usize) -> Option<Vec<u32>> {
        let mut bits = self.bits.lock().expect("free map lock poisoned");
        let mut granted = Vec::with_capacity(count);
        for (sector, bit) in bits.iter_mut().enumerate() {
            if granted.len() == count {
                break;
            }
            if !*bit {
                *bit = true;
                granted.push(sector as u32);
            }
        }
        if granted.len() == count {
            return Some(granted);
        }
        for sector in &granted {
            bits[*sector as usize] = false;
        }
        None
    }

    /// Marks a specific sector in-use directly, bypassing the scan in
    /// `allocate`. Used only at format time to reserve the sectors backing
    /// the free map's own persisted bitmap, which cannot go through
    /// `allocate` because the bitmap they'd be allocated from doesn't exist
    /// yet at that point.
    pub fn reserve(&self, sector: u32) {
        let mut bits = self.bits.lock().expect("free map lock poisoned");
        let bit = bits
            .get_mut(sector as usize)
            .expect("reserve of out-of-range sector");
        assert!(!*bit, "sector {sector} already reserved");
        *bit = true;
    }

    /// Clears a single sector's bit. Panics if it was already clear — a
    /// double release is a logic error in the caller, not a recoverable
    /// condition.
    pub fn release(&self, sector: u32) {
        let mut bits = self.bits.lock().expect("free map lock poisoned");
        let bit = bits
            .get_mut(sector as usize)
            .expect("release of out-of-range sector");
        assert!(*bit, "double release of sector {sector}");
        *bit = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_reserves_the_two_boot_sectors() {
        let fm = FreeMap::format(16);
        let bits = fm.to_bits();
        assert!(bits[FREE_MAP_SECTOR as usize]);
        assert!(bits[ROOT_DIR_SECTOR as usize]);
        assert_eq!(bits.iter().filter(|b| **b).count(), 2);
    }

    #[test]
    fn allocate_grants_non_consecutive_sectors_and_skips_reserved() {
        let fm = FreeMap::format(4);
        let granted = fm.allocate(2).unwrap();
        assert_eq!(granted.len(), 2);
        assert!(!granted.contains(&FREE_MAP_SECTOR));
        assert!(!granted.contains(&ROOT_DIR_SECTOR));
    }

    #[test]
    fn allocate_rolls_back_on_partial_failure() {
        let fm = FreeMap::format(4);
        // only 2 sectors free (2, 3); asking for 3 must fail cleanly.
        assert!(fm.allocate(3).is_none());
        // the 2 that were free remain free afterward.
        let granted = fm.allocate(2).unwrap();
        assert_eq!(granted.len(), 2);
    }

    #[test]
    fn release_frees_a_sector_for_reuse() {
        let fm = FreeMap::format(4);
        let granted = fm.allocate(1).unwrap();
        fm.release(granted[0]);
        let again = fm.allocate(1).unwrap();
        assert_eq!(again[0], granted[0]);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn release_twice_panics() {
        let fm = FreeMap::format(4);
        let granted = fm.allocate(1).unwrap();
        fm.release(granted[0]);
        fm.release(granted[0]);
    }
}
