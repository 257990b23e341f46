//! Per-child virtual memory map.
//!
//! A [`RegionList`] maps a child's virtual ranges to their backing source
//! and permissions, and tracks which pages have actually been delegated.
//! Mapping is page-granular, lazy and monotonic: a page becomes mapped
//! exactly once, the first time its fault is resolved, and is never
//! unmapped implicitly.

use cap_types::{Rights, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest virtual address [`RegionList::find_free`] will hand out
pub const FREE_BASE: u64 = 0x7000_0000;

/// Errors for region map mutation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// The new range intersects an existing entry
    #[error("region {virt:#x}+{len:#x} overlaps an existing region")]
    Overlap { virt: u64, len: u64 },

    /// The range does not start on a page boundary
    #[error("region base {virt:#x} is not page aligned")]
    Misaligned { virt: u64 },
}

/// One contiguous virtual range backed by one contiguous source range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    virt: u64,
    len: u64,
    source: u64,
    perms: Rights,
    /// One flag per page, set when the page's capability was delegated
    mapped: Vec<bool>,
}

impl Region {
    fn page_count(&self) -> usize {
        ((self.len + PAGE_SIZE - 1) / PAGE_SIZE) as usize
    }

    fn end(&self) -> u64 {
        self.virt + self.page_count() as u64 * PAGE_SIZE
    }

    pub fn virt(&self) -> u64 {
        self.virt
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn source(&self) -> u64 {
        self.source
    }

    pub fn perms(&self) -> Rights {
        self.perms
    }
}

/// Result of resolving an address against the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHit {
    /// Source address of the containing page
    pub source_page: u64,
    /// Permissions of the covering region
    pub perms: Rights,
    /// Whether this page was already delegated
    pub mapped: bool,
}

/// Ordered, non-overlapping set of regions scoped to one child.
#[derive(Debug, Clone, Default)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Adds a region; `virt` must be page aligned and the page-rounded
    /// range must not intersect any existing entry.
    pub fn add(
        &mut self,
        virt: u64,
        len: u64,
        source: u64,
        perms: Rights,
    ) -> Result<(), RegionError> {
        if virt % PAGE_SIZE != 0 {
            return Err(RegionError::Misaligned { virt });
        }
        let region = Region {
            virt,
            len,
            source,
            perms,
            mapped: Vec::new(),
        };
        let pages = region.page_count();
        let end = region.end();
        for existing in &self.regions {
            if virt < existing.end() && existing.virt < end {
                return Err(RegionError::Overlap { virt, len });
            }
        }
        let mut region = region;
        region.mapped = vec![false; pages];
        self.regions.push(region);
        self.regions.sort_by_key(|r| r.virt);
        Ok(())
    }

    fn locate(&self, addr: u64) -> Option<(&Region, usize)> {
        let page = addr & !(PAGE_SIZE - 1);
        self.regions
            .iter()
            .find(|r| page >= r.virt && page < r.end())
            .map(|r| (r, ((page - r.virt) / PAGE_SIZE) as usize))
    }

    /// Resolves `addr` to its backing source page, if any region covers it
    pub fn find(&self, addr: u64) -> Option<RegionHit> {
        self.locate(addr).map(|(region, index)| RegionHit {
            source_page: region.source + index as u64 * PAGE_SIZE,
            perms: region.perms,
            mapped: region.mapped[index],
        })
    }

    /// Records that the page containing `addr` has been delegated.
    ///
    /// Returns false when no region covers `addr`.
    pub fn mark_mapped(&mut self, addr: u64) -> bool {
        let page = addr & !(PAGE_SIZE - 1);
        for region in &mut self.regions {
            if page >= region.virt && page < region.end() {
                let index = ((page - region.virt) / PAGE_SIZE) as usize;
                region.mapped[index] = true;
                return true;
            }
        }
        false
    }

    /// Picks a free page-aligned virtual base able to hold `len` bytes.
    ///
    /// Placement starts at [`FREE_BASE`], keeping clear of image-chosen
    /// addresses, and skips past any existing region the candidate span
    /// would collide with. Regions are kept sorted by base, so one pass
    /// finds the lowest fitting gap.
    pub fn find_free(&self, len: u64) -> u64 {
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut candidate = FREE_BASE;
        for region in &self.regions {
            if region.end() <= candidate {
                continue;
            }
            if candidate + len <= region.virt {
                break;
            }
            candidate = region.end();
        }
        candidate
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_resolves_to_page_within_region() {
        let mut map = RegionList::new();
        map.add(0x10000, 2 * PAGE_SIZE, 0x80000, Rights::read_execute())
            .unwrap();
        let hit = map.find(0x11004).unwrap();
        assert_eq!(hit.source_page, 0x80000 + PAGE_SIZE);
        assert_eq!(hit.perms, Rights::read_execute());
        assert!(!hit.mapped);
    }

    #[test]
    fn test_find_outside_all_regions_misses() {
        let mut map = RegionList::new();
        map.add(0x10000, PAGE_SIZE, 0x80000, Rights::read_only())
            .unwrap();
        assert!(map.find(0x20000).is_none());
    }

    #[test]
    fn test_mark_mapped_is_per_page() {
        let mut map = RegionList::new();
        map.add(0x10000, 2 * PAGE_SIZE, 0x80000, Rights::read_write())
            .unwrap();
        assert!(map.mark_mapped(0x10008));
        assert!(map.find(0x10000).unwrap().mapped);
        assert!(!map.find(0x10000 + PAGE_SIZE).unwrap().mapped);
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut map = RegionList::new();
        map.add(0x10000, 2 * PAGE_SIZE, 0x80000, Rights::read_only())
            .unwrap();
        let result = map.add(0x11000, PAGE_SIZE, 0x90000, Rights::read_only());
        assert!(matches!(result, Err(RegionError::Overlap { .. })));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_misaligned_base_is_rejected() {
        let mut map = RegionList::new();
        let result = map.add(0x10010, PAGE_SIZE, 0x80000, Rights::read_only());
        assert!(matches!(result, Err(RegionError::Misaligned { .. })));
    }

    #[test]
    fn test_partial_page_region_covers_whole_page() {
        let mut map = RegionList::new();
        map.add(0x10000, 100, 0x80000, Rights::read_only()).unwrap();
        assert!(map.find(0x10FFF).is_some());
        assert!(map.find(0x11000).is_none());
    }

    #[test]
    fn test_find_free_takes_the_lowest_fitting_gap() {
        let mut map = RegionList::new();
        assert_eq!(map.find_free(PAGE_SIZE), FREE_BASE);
        map.add(FREE_BASE, PAGE_SIZE, 0, Rights::read_write()).unwrap();
        assert_eq!(map.find_free(PAGE_SIZE), FREE_BASE + PAGE_SIZE);
        // a gap big enough for one page but not two
        map.add(FREE_BASE + 2 * PAGE_SIZE, PAGE_SIZE, 0, Rights::read_write())
            .unwrap();
        assert_eq!(map.find_free(PAGE_SIZE), FREE_BASE + PAGE_SIZE);
        assert_eq!(map.find_free(2 * PAGE_SIZE), FREE_BASE + 3 * PAGE_SIZE);
    }

    #[test]
    fn test_find_free_skips_fixed_high_regions() {
        let mut map = RegionList::new();
        map.add(FREE_BASE + 2 * PAGE_SIZE, PAGE_SIZE, 0, Rights::read_only())
            .unwrap();
        // a span too large for the gap below the fixed region must land
        // above it, not across it
        let base = map.find_free(4 * PAGE_SIZE);
        assert_eq!(base, FREE_BASE + 3 * PAGE_SIZE);
        map.add(base, 4 * PAGE_SIZE, 0, Rights::read_write()).unwrap();
    }
}
