//! Batched capability transfer planning.
//!
//! A bulk transfer whose source base and destination hotspot are not
//! equally aligned cannot move in one kernel operation: each typed item
//! must describe a span aligned at both ends. The planner splits such a
//! transfer into the fewest synchronous calls, making every step as large
//! as the alignment and the per-call typed-item budget allow.

use cap_types::CapRange;

/// Plans a transfer of `range` as a sequence of per-call chunks.
///
/// Each returned chunk fits in one call: its aligned-block decomposition
/// never needs more than `typed_capacity` typed items. Chunks are
/// contiguous, cover exactly `range.count()` units, and carry the
/// advancing hotspot when the range has one.
///
/// When base and hotspot differ, the lowest bit position `k` at which
/// they differ bounds the largest aligned block to `2^k` units; the step
/// size is then `min(typed_capacity - k, remaining >> k) << k`, clamped
/// to the remaining count.
pub fn plan_transfer(range: &CapRange, typed_capacity: usize) -> Vec<CapRange> {
    assert!(typed_capacity > 0);
    let mut chunks = Vec::new();
    let mut start = range.start();
    let mut hotspot = range.hotspot();
    let mut remaining = range.count();

    while remaining > 0 {
        let mut take = remaining;
        if let Some(h) = hotspot {
            let diff = h ^ start;
            if diff != 0 {
                let k = diff.trailing_zeros();
                if (1u64 << k) < remaining {
                    // aligning to 2^k costs at most k typed items per call
                    let blocks = (typed_capacity as u64).saturating_sub(u64::from(k)).max(1);
                    take = blocks.min(remaining >> k) << k;
                }
            }
        }

        let mut chunk = CapRange::new(range.kind(), start, take.min(remaining), range.rights());
        if let Some(h) = hotspot {
            chunk = chunk.with_hotspot(h);
        }
        let take = clamp_to_typed_capacity(&chunk, typed_capacity);
        chunk = CapRange::new(range.kind(), start, take, range.rights());
        if let Some(h) = hotspot {
            chunk = chunk.with_hotspot(h);
        }
        chunks.push(chunk);

        start += take;
        hotspot = hotspot.map(|h| h + take);
        remaining -= take;
    }
    chunks
}

/// Units of `chunk` coverable without exceeding `typed_capacity` items
fn clamp_to_typed_capacity(chunk: &CapRange, typed_capacity: usize) -> u64 {
    let mut covered = 0;
    for block in chunk.aligned_blocks().into_iter().take(typed_capacity) {
        covered += block.len();
    }
    covered
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_types::{CapKind, Rights};

    fn check_plan(start: u64, hotspot: Option<u64>, count: u64, typed_capacity: usize) {
        let mut range = CapRange::new(CapKind::Memory, start, count, Rights::read_write());
        if let Some(h) = hotspot {
            range = range.with_hotspot(h);
        }
        let chunks = plan_transfer(&range, typed_capacity);

        let mut expect_start = start;
        let mut expect_hotspot = hotspot;
        let mut covered = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start(), expect_start, "gap or overlap in plan");
            assert_eq!(chunk.hotspot(), expect_hotspot);
            assert!(
                chunk.typed_item_cost() <= typed_capacity,
                "chunk {chunk} needs {} items, capacity {typed_capacity}",
                chunk.typed_item_cost()
            );
            for block in chunk.aligned_blocks() {
                assert_eq!(block.base % block.len(), 0);
                if let Some(h) = block.hotspot {
                    assert!(h == 0 || h % block.len() == 0);
                }
            }
            expect_start += chunk.count();
            expect_hotspot = expect_hotspot.map(|h| h + chunk.count());
            covered += chunk.count();
        }
        assert_eq!(covered, count, "plan does not cover the whole range");
    }

    #[test]
    fn test_aligned_transfer_is_one_chunk() {
        let range = CapRange::new(CapKind::Memory, 0x1000, 16, Rights::read_only())
            .with_hotspot(0x5000);
        let chunks = plan_transfer(&range, 64);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].count(), 16);
    }

    #[test]
    fn test_misaligned_hotspot_splits_by_differing_bit() {
        // base and hotspot differ first at bit 0: one unit per block
        check_plan(0x1000, Some(0x1001), 8, 4);
        // differ first at bit 2: blocks of four
        check_plan(0x1000, Some(0x1004), 64, 8);
    }

    #[test]
    fn test_plan_covers_without_gaps() {
        check_plan(100, Some(517), 37, 6);
        check_plan(0, Some(0x7ff), 129, 5);
        check_plan(0x1234, None, 300, 4);
        check_plan(3, Some(3), 11, 3);
    }

    #[test]
    fn test_tiny_capacity_still_makes_progress() {
        check_plan(0x0fff, Some(0x2001), 16, 1);
    }

    #[test]
    fn test_no_hotspot_bounded_only_by_capacity() {
        let range = CapRange::new(CapKind::IoPort, 100, 5, Rights::full());
        let chunks = plan_transfer(&range, 1);
        // spans at 100 (four ports) and 104 (one)
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].count(), 4);
        assert_eq!(chunks[1].start(), 104);
        assert_eq!(chunks[1].count(), 1);
    }
}
