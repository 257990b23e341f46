//! Kernel interface trait and scheduling descriptors.

use crate::KernelError;
use cap_types::{CapRange, DomainCap, ExecContextCap, PortalId, SchedContextCap, SemaphoreCap};
use serde::{Deserialize, Serialize};

/// Priority/quantum pair carried by a scheduling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qpd {
    pub priority: u32,
    pub quantum: u32,
}

impl Qpd {
    pub const fn new(priority: u32, quantum: u32) -> Self {
        Self { priority, quantum }
    }
}

impl Default for Qpd {
    fn default() -> Self {
        Self::new(1, 10_000)
    }
}

/// The capability-kernel primitives the supervisor consumes.
///
/// # Design Principles
///
/// **Explicit construction**: isolation domains, execution contexts and
/// scheduling contexts are created one by one, with their relationships
/// spelled out; nothing is forked or inherited.
///
/// **All-or-nothing**: each operation either fully succeeds or leaves no
/// trace; the kernel's internal concurrency is out of scope here.
///
/// **Capability transfer**: authority moves only through explicit
/// delegation and is withdrawn only through explicit revocation.
pub trait KernelInterface {
    /// Creates an empty isolation domain
    fn create_isolation_domain(&mut self) -> Result<DomainCap, KernelError>;

    /// Creates an execution context inside `domain`, bound to `cpu`,
    /// starting at `entry`
    fn create_execution_context(
        &mut self,
        domain: DomainCap,
        cpu: usize,
        entry: u64,
    ) -> Result<ExecContextCap, KernelError>;

    /// Binds `context` to CPU time; the context becomes runnable
    fn create_scheduling_context(
        &mut self,
        context: ExecContextCap,
        qpd: Qpd,
    ) -> Result<SchedContextCap, KernelError>;

    /// Creates an RPC entry point visible inside `domain`
    fn create_portal(&mut self, domain: DomainCap) -> Result<PortalId, KernelError>;

    /// Creates a counting semaphore with the given initial count
    fn create_semaphore(&mut self, initial: u64) -> Result<SemaphoreCap, KernelError>;

    /// Signals a semaphore, waking at most one waiter
    fn semaphore_up(&mut self, sem: SemaphoreCap) -> Result<(), KernelError>;

    /// Attempts to consume one count from a semaphore.
    ///
    /// Returns `true` when a count was consumed; `false` means the
    /// counter was zero and the calling context must park until the
    /// next [`KernelInterface::semaphore_up`].
    fn semaphore_down(&mut self, sem: SemaphoreCap) -> Result<bool, KernelError>;

    /// Delegates `range` into `target`, relocated to the range's hotspot
    fn delegate(&mut self, target: DomainCap, range: CapRange) -> Result<(), KernelError>;

    /// Withdraws access to `range` everywhere it was delegated.
    ///
    /// The kernel accepts only power-of-two-aligned spans; callers
    /// decompose arbitrary ranges first.
    fn revoke(&mut self, range: CapRange) -> Result<(), KernelError>;

    fn release_isolation_domain(&mut self, domain: DomainCap) -> Result<(), KernelError>;

    fn release_execution_context(&mut self, context: ExecContextCap) -> Result<(), KernelError>;

    fn release_scheduling_context(&mut self, context: SchedContextCap) -> Result<(), KernelError>;

    fn release_portal(&mut self, portal: PortalId) -> Result<(), KernelError>;

    fn release_semaphore(&mut self, sem: SemaphoreCap) -> Result<(), KernelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpd_defaults() {
        let qpd = Qpd::default();
        assert_eq!(qpd.priority, 1);
        assert_eq!(qpd.quantum, 10_000);
    }
}
