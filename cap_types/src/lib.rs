//! # Capability Types
//!
//! This crate defines the fundamental capability vocabulary of Capstan,
//! the root supervisor of a capability-based microkernel userland.
//!
//! ## Philosophy
//!
//! 1. **Unforgeable**: capabilities are opaque handles; nothing in this
//!    crate can mint authority, only describe it
//! 2. **Ranges, not singletons**: bulk transfer is first-class, so a
//!    contiguous aligned block of capabilities has a compact description
//! 3. **Typed**: kernel objects of different kinds get distinct handle
//!    types and cannot be confused
//! 4. **Testable**: everything here is plain data that works under
//!    `cargo test`

pub mod caprange;
pub mod ids;
pub mod perms;

pub use caprange::{minshift, AlignedBlock, CapKind, CapRange, PAGE_SHIFT, PAGE_SIZE};
pub use ids::{
    ChildId, DomainCap, ExecContextCap, ObjectRef, PortalId, SchedContextCap, SemaphoreCap,
};
pub use perms::Rights;
