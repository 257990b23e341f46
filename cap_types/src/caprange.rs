//! Capability range descriptors and the aligned-block algebra.
//!
//! The kernel's delegation and revocation primitives operate on
//! power-of-two-aligned spans. A [`CapRange`] describes an arbitrary
//! contiguous block of capabilities of one kind; [`CapRange::aligned_blocks`]
//! decomposes it into the minimal sequence of maximal aligned spans the
//! kernel can accept.

use crate::perms::Rights;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one page in bytes
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Kind of resource a capability range refers to.
///
/// The kind is immutable after construction; a range can never be
/// reinterpreted as a different resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapKind {
    /// Physical memory frames, indexed by frame number
    Memory,
    /// I/O ports, indexed by port number
    IoPort,
    /// Abstract kernel-object selectors (portals, interrupt semaphores)
    Object,
}

impl fmt::Display for CapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapKind::Memory => write!(f, "mem"),
            CapKind::IoPort => write!(f, "io"),
            CapKind::Object => write!(f, "obj"),
        }
    }
}

/// Largest shift `s` such that `base` is aligned to `2^s` and `2^s <= count`.
///
/// This is the span size the kernel will accept for a revocation or
/// delegation starting at `base` with `count` units left.
pub fn minshift(base: u64, count: u64) -> u32 {
    debug_assert!(count > 0);
    let align = if base == 0 {
        63
    } else {
        base.trailing_zeros()
    };
    let fit = 63 - count.leading_zeros();
    align.min(fit)
}

/// One power-of-two-aligned span produced by range decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedBlock {
    /// First unit of the span; aligned to `2^order`
    pub base: u64,
    /// log2 of the span length
    pub order: u32,
    /// Relocation target for the span, when the enclosing range has one
    pub hotspot: Option<u64>,
}

impl AlignedBlock {
    /// Number of units covered by this span
    pub fn len(&self) -> u64 {
        1 << self.order
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Description of a contiguous block of capabilities of one kind.
///
/// Attributes: base index, unit count, kind, access rights, and an
/// optional *hotspot* -- the base the block should be relocated to at the
/// receiver. The kind is fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRange {
    kind: CapKind,
    start: u64,
    count: u64,
    rights: Rights,
    hotspot: Option<u64>,
}

impl CapRange {
    /// Creates a range with no relocation target
    pub fn new(kind: CapKind, start: u64, count: u64, rights: Rights) -> Self {
        Self {
            kind,
            start,
            count,
            rights,
            hotspot: None,
        }
    }

    /// Sets the receiver-side relocation target
    pub fn with_hotspot(mut self, hotspot: u64) -> Self {
        self.hotspot = Some(hotspot);
        self
    }

    pub fn kind(&self) -> CapKind {
        self.kind
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    pub fn hotspot(&self) -> Option<u64> {
        self.hotspot
    }

    /// Decomposes the range into maximal aligned spans.
    ///
    /// Every span is aligned to its own length, both at the source base
    /// and (when a hotspot is present) at the relocated base. Spans cover
    /// exactly `count` units with no gaps or overlaps.
    pub fn aligned_blocks(&self) -> Vec<AlignedBlock> {
        let mut blocks = Vec::new();
        let mut base = self.start;
        let mut left = self.count;
        while left > 0 {
            let mut shift = minshift(base, left);
            let hotspot = self.hotspot.map(|h| h + (base - self.start));
            if let Some(h) = hotspot {
                // the span must be aligned at the relocated base as well
                if h != 0 {
                    shift = shift.min(h.trailing_zeros());
                }
            }
            let block = AlignedBlock {
                base,
                order: shift,
                hotspot,
            };
            base += block.len();
            left -= block.len();
            blocks.push(block);
        }
        blocks
    }

    /// Number of typed items needed to carry this range in one IPC call
    pub fn typed_item_cost(&self) -> usize {
        self.aligned_blocks().len()
    }
}

impl fmt::Display for CapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{:#x}+{:#x} {}]",
            self.kind, self.start, self.count, self.rights
        )?;
        if let Some(h) = self.hotspot {
            write!(f, "@{:#x}", h)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_union(blocks: &[AlignedBlock]) -> Vec<u64> {
        let mut units = Vec::new();
        for b in blocks {
            for u in b.base..b.base + b.len() {
                units.push(u);
            }
        }
        units
    }

    #[test]
    fn test_minshift_bounded_by_alignment() {
        assert_eq!(minshift(100, 5), 2); // 100 is 4-aligned
        assert_eq!(minshift(104, 1), 0);
        assert_eq!(minshift(0x1000, 0x1000), 12);
    }

    #[test]
    fn test_minshift_bounded_by_count() {
        assert_eq!(minshift(0, 3), 1);
        assert_eq!(minshift(256, 7), 2);
    }

    #[test]
    fn test_aligned_blocks_cover_exactly() {
        let range = CapRange::new(CapKind::IoPort, 100, 5, Rights::full());
        let blocks = range.aligned_blocks();
        assert_eq!(block_union(&blocks), (100..105).collect::<Vec<_>>());
        for b in &blocks {
            assert_eq!(b.base % b.len(), 0, "span {b:?} crosses its alignment");
        }
    }

    #[test]
    fn test_aligned_blocks_respect_hotspot_alignment() {
        let range =
            CapRange::new(CapKind::Memory, 0x100, 8, Rights::read_only()).with_hotspot(0x204);
        for b in range.aligned_blocks() {
            assert_eq!(b.base % b.len(), 0);
            let h = b.hotspot.unwrap();
            assert_eq!(h % b.len(), 0, "hotspot {h:#x} not aligned to {}", b.len());
        }
    }

    #[test]
    fn test_single_page_range_is_one_block() {
        let range = CapRange::new(CapKind::Memory, 0x42, 1, Rights::read_write());
        let blocks = range.aligned_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].base, 0x42);
        assert_eq!(blocks[0].order, 0);
    }

    #[test]
    fn test_kind_is_immutable() {
        let range = CapRange::new(CapKind::Object, 7, 1, Rights::full()).with_hotspot(9);
        assert_eq!(range.kind(), CapKind::Object);
        assert_eq!(range.hotspot(), Some(9));
    }

    #[test]
    fn test_caprange_serde_round_trip() {
        let range = CapRange::new(CapKind::Memory, 0x10, 4, Rights::read_execute())
            .with_hotspot(0x20);
        let json = serde_json::to_string(&range).unwrap();
        let back: CapRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }
}
