//! Access rights for memory pages and capability ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission triple attached to a memory region or capability range.
///
/// Rights follow the principle of least privilege: the default grants
/// nothing, and every constructor names exactly what it allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rights {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Rights {
    /// No rights
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    /// Read-only
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    /// Read and write (data segments, stacks)
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    /// Read and execute (code segments)
    pub fn read_execute() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }

    /// All rights; used for I/O port and object ranges where the
    /// permission triple does not subdivide further
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    pub fn can_read(&self) -> bool {
        self.read
    }

    pub fn can_write(&self) -> bool {
        self.write
    }

    pub fn can_execute(&self) -> bool {
        self.execute
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rights_constructors() {
        assert!(Rights::read_only().can_read());
        assert!(!Rights::read_only().can_write());
        assert!(Rights::read_write().can_write());
        assert!(Rights::read_execute().can_execute());
        assert!(!Rights::none().can_read());
        assert!(Rights::full().can_execute());
    }

    #[test]
    fn test_rights_display() {
        assert_eq!(format!("{}", Rights::read_execute()), "r-x");
        assert_eq!(format!("{}", Rights::none()), "---");
        assert_eq!(format!("{}", Rights::full()), "rwx");
    }

    #[test]
    fn test_rights_default_grants_nothing() {
        assert_eq!(Rights::default(), Rights::none());
    }
}
