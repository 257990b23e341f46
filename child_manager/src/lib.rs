//! # Child Manager
//!
//! The root supervisor of a capability-microkernel userland: it loads
//! children from boot modules, gives each an isolated domain and a
//! scheduling context, and mediates every resource they touch.
//!
//! ## Philosophy
//!
//! Children receive nothing implicitly. Memory arrives one page at a
//! time through the fault path, I/O ports and interrupt lines through
//! explicit allocation, service capabilities through the registry. When
//! a child cannot be repaired it is destroyed, alone, through the
//! reference-counted teardown path; the supervisor itself never dies on
//! a child's behalf.

pub mod boot;
pub mod child;
pub mod diag;
pub mod manager;
pub mod region_list;

pub use boot::{terminate_cmdline, BootInfo, BootModule, BOOT_INFO_ADDR};
pub use child::{Child, ChildState, ExecContext, Wakeup};
pub use diag::{LogEntry, LogLevel, SupervisorLog};
pub use manager::{
    ChildManager, ChildManagerError, FaultInfo, FaultOutcome, PortalBinding, PortalOp,
    RegisterFrame, CONTROL_BLOCK_ADDR, MAX_CHILDREN, RESOURCE_ALLOC, RESOURCE_RELEASE, STACK_SIZE,
};
pub use region_list::{Region, RegionError, RegionHit, RegionList};
