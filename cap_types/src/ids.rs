//! Unique identifiers and typed kernel-object handles.
//!
//! Every kernel object the supervisor creates on behalf of a child gets
//! its own handle type, so an execution context can never be passed where
//! an isolation domain is expected. Handles are opaque identifiers, never
//! index arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a loaded child task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildId(Uuid);

impl ChildId {
    /// Creates a new random child ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child:{}", self.0)
    }
}

/// Identity of one RPC entry point (portal)
///
/// A portal is a kernel-registered handler address bound to a callee
/// execution context. The supervisor maps each portal identity back to
/// the child and CPU it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortalId(Uuid);

impl PortalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PortalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "portal:{}", self.0)
    }
}

/// Handle to an isolation domain (address-space/capability-space container)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainCap(Uuid);

impl DomainCap {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DomainCap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DomainCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain:{}", self.0)
    }
}

/// Handle to one schedulable execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecContextCap(Uuid);

impl ExecContextCap {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecContextCap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecContextCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ec:{}", self.0)
    }
}

/// Handle to a scheduling context (priority/quantum binding to CPU time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedContextCap(Uuid);

impl SchedContextCap {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SchedContextCap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SchedContextCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sc:{}", self.0)
    }
}

/// Handle to a counting semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemaphoreCap(Uuid);

impl SemaphoreCap {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SemaphoreCap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SemaphoreCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm:{}", self.0)
    }
}

/// Type-erased reference to a single kernel object capability.
///
/// Used on the wire when one concrete object (a portal, a domain, an
/// execution context) is transferred as a typed item, as opposed to a
/// selector range described by [`crate::CapRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef(Uuid);

impl ObjectRef {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<DomainCap> for ObjectRef {
    fn from(cap: DomainCap) -> Self {
        Self(cap.as_uuid())
    }
}

impl From<ExecContextCap> for ObjectRef {
    fn from(cap: ExecContextCap) -> Self {
        Self(cap.as_uuid())
    }
}

impl From<SchedContextCap> for ObjectRef {
    fn from(cap: SchedContextCap) -> Self {
        Self(cap.as_uuid())
    }
}

impl From<PortalId> for ObjectRef {
    fn from(cap: PortalId) -> Self {
        Self(cap.as_uuid())
    }
}

impl From<SemaphoreCap> for ObjectRef {
    fn from(cap: SemaphoreCap) -> Self {
        Self(cap.as_uuid())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ChildId::new(), ChildId::new());
        assert_ne!(PortalId::new(), PortalId::new());
        assert_ne!(DomainCap::new(), DomainCap::new());
    }

    #[test]
    fn test_object_ref_preserves_identity() {
        let domain = DomainCap::new();
        let obj = ObjectRef::from(domain);
        assert_eq!(obj.as_uuid(), domain.as_uuid());
    }

    #[test]
    fn test_display_prefixes() {
        assert!(format!("{}", ChildId::new()).starts_with("child:"));
        assert!(format!("{}", ExecContextCap::new()).starts_with("ec:"));
        assert!(format!("{}", SemaphoreCap::new()).starts_with("sm:"));
    }
}
