//! # Resources
//!
//! Exclusive allocators for the platform's finite, unit-indexed resources:
//! I/O ports and interrupt lines.
//!
//! ## Philosophy
//!
//! - **Resources are finite and must be explicit**
//! - **Allocation and release are exact inverses**
//! - **All-or-nothing**: a partially free range is never split-allocated
//! - **No POSIX concepts** (no fcntl-style advisory claims)
//!
//! Revocation of already-granted kernel access is the caller's concern;
//! the aligned-span decomposition it needs lives in `cap_types`.

use thiserror::Error;

/// Number of addressable I/O ports
pub const PORT_SPACE: u64 = 0x1_0000;

/// Default number of interrupt lines
pub const IRQ_LINES: u64 = 128;

/// Errors for allocator operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Some unit in the range is already allocated or reserved
    #[error("resource range {base}..{} denied", .base + .count)]
    Denied { base: u64, count: u64 },

    /// Some unit in the range was not allocated; release is a caller error
    #[error("release of unallocated resource range {base}..{}", .base + .count)]
    NotAllocated { base: u64, count: u64 },

    /// The range does not fit the unit space
    #[error("resource range {base}..{} out of bounds", .base + .count)]
    OutOfRange { base: u64, count: u64 },
}

/// Bitmap allocator over a contiguous unit space, free by default.
pub struct UnitAllocator {
    bits: Vec<u64>,
    len: u64,
}

impl UnitAllocator {
    /// Creates an allocator with every unit free
    pub fn new(len: u64) -> Self {
        let words = ((len + 63) / 64) as usize;
        Self {
            bits: vec![0; words],
            len,
        }
    }

    /// Allocator over the full I/O port space
    pub fn ports() -> Self {
        Self::new(PORT_SPACE)
    }

    /// Allocator over the platform's interrupt lines
    pub fn irqs() -> Self {
        Self::new(IRQ_LINES)
    }

    /// Marks units as taken at startup (platform reservations); the
    /// range must be entirely free
    pub fn reserve(&mut self, base: u64, count: u64) -> Result<(), ResourceError> {
        self.allocate(base, count)
    }

    fn bit(&self, unit: u64) -> bool {
        self.bits[(unit / 64) as usize] & (1 << (unit % 64)) != 0
    }

    fn set_bit(&mut self, unit: u64, value: bool) {
        let word = (unit / 64) as usize;
        let mask = 1 << (unit % 64);
        if value {
            self.bits[word] |= mask;
        } else {
            self.bits[word] &= !mask;
        }
    }

    fn check_range(&self, base: u64, count: u64) -> Result<(), ResourceError> {
        let end = base
            .checked_add(count)
            .ok_or(ResourceError::OutOfRange { base, count })?;
        if count == 0 || end > self.len {
            return Err(ResourceError::OutOfRange { base, count });
        }
        Ok(())
    }

    /// Exclusively allocates `count` units starting at `base`.
    ///
    /// Fails without any state change if a single unit is taken.
    pub fn allocate(&mut self, base: u64, count: u64) -> Result<(), ResourceError> {
        self.check_range(base, count)?;
        if (base..base + count).any(|unit| self.bit(unit)) {
            return Err(ResourceError::Denied { base, count });
        }
        for unit in base..base + count {
            self.set_bit(unit, true);
        }
        Ok(())
    }

    /// Releases `count` units starting at `base`.
    ///
    /// Releasing a unit that was never allocated is a caller error and
    /// leaves the allocator unchanged.
    pub fn release(&mut self, base: u64, count: u64) -> Result<(), ResourceError> {
        self.check_range(base, count)?;
        if (base..base + count).any(|unit| !self.bit(unit)) {
            return Err(ResourceError::NotAllocated { base, count });
        }
        for unit in base..base + count {
            self.set_bit(unit, false);
        }
        Ok(())
    }

    /// True when every unit of the range is currently allocated
    pub fn is_allocated(&self, base: u64, count: u64) -> bool {
        self.check_range(base, count).is_ok() && (base..base + count).all(|unit| self.bit(unit))
    }

    /// Number of units this allocator manages
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_then_release_round_trip() {
        let mut ports = UnitAllocator::ports();
        ports.allocate(0x3f8, 8).unwrap();
        assert!(ports.is_allocated(0x3f8, 8));
        ports.release(0x3f8, 8).unwrap();
        assert!(!ports.is_allocated(0x3f8, 1));
    }

    #[test]
    fn test_overlapping_allocation_denied_without_change() {
        let mut ports = UnitAllocator::ports();
        ports.allocate(100, 4).unwrap();
        assert_eq!(
            ports.allocate(102, 4),
            Err(ResourceError::Denied { base: 102, count: 4 })
        );
        // the free tail of the denied range stayed free
        assert!(!ports.bit(104));
        assert!(!ports.bit(105));
    }

    #[test]
    fn test_release_of_unallocated_is_caller_error() {
        let mut irqs = UnitAllocator::irqs();
        assert_eq!(
            irqs.release(9, 1),
            Err(ResourceError::NotAllocated { base: 9, count: 1 })
        );
        irqs.allocate(8, 2).unwrap();
        // partially-free release also fails, leaving the allocation intact
        assert!(irqs.release(8, 4).is_err());
        assert!(irqs.is_allocated(8, 2));
    }

    #[test]
    fn test_reserved_ranges_stay_taken() {
        let mut ports = UnitAllocator::ports();
        ports.reserve(0, 0x400).unwrap();
        assert!(ports.allocate(0x3f8, 8).is_err());
        assert!(ports.allocate(0x400, 8).is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut irqs = UnitAllocator::irqs();
        assert!(matches!(
            irqs.allocate(IRQ_LINES - 1, 2),
            Err(ResourceError::OutOfRange { .. })
        ));
        assert!(matches!(
            irqs.allocate(5, 0),
            Err(ResourceError::OutOfRange { .. })
        ));
    }

}
