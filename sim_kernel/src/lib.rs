//! # Simulated Kernel
//!
//! This crate provides a simulated implementation of the kernel interface.
//!
//! ## Purpose
//!
//! The simulated kernel allows testing the supervisor without hardware:
//! - Runs under `cargo test`
//! - Deterministic (no real concurrency, no real scheduling)
//! - Inspectable (object tables and a full delegation/revocation audit log)
//!
//! ## Philosophy
//!
//! **Testability is a first-class design constraint.**
//!
//! This is not a mock: it is a full implementation of the kernel interface
//! that happens to run in-process. Every capability operation the
//! supervisor performs is recorded, so tests can assert the exact sequence
//! of delegations, revocations and releases.

use cap_types::{CapRange, DomainCap, ExecContextCap, PortalId, SchedContextCap, SemaphoreCap};
use kernel_api::{KernelError, KernelInterface, Qpd};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One recorded kernel operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    Delegated { target: DomainCap, range: CapRange },
    Revoked { range: CapRange },
    SemaphoreSignalled { sem: SemaphoreCap },
    SemaphoreConsumed { sem: SemaphoreCap },
    DomainReleased { domain: DomainCap },
    ContextReleased { context: ExecContextCap },
    SchedReleased { context: SchedContextCap },
    PortalReleased { portal: PortalId },
    SemaphoreReleased { sem: SemaphoreCap },
}

#[derive(Debug, Clone)]
struct ContextState {
    domain: DomainCap,
    cpu: usize,
    entry: u64,
}

/// In-process kernel with directly inspectable state.
pub struct SimulatedKernel {
    domains: HashMap<DomainCap, Vec<PortalId>>,
    contexts: HashMap<ExecContextCap, ContextState>,
    scheds: HashMap<SchedContextCap, ExecContextCap>,
    portals: HashMap<PortalId, DomainCap>,
    semaphores: HashMap<SemaphoreCap, u64>,
    audit: Vec<AuditEvent>,
    deny_delegations: usize,
    deny_sched_contexts: usize,
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self {
            domains: HashMap::new(),
            contexts: HashMap::new(),
            scheds: HashMap::new(),
            portals: HashMap::new(),
            semaphores: HashMap::new(),
            audit: Vec::new(),
            deny_delegations: 0,
            deny_sched_contexts: 0,
        }
    }

    /// All operations recorded so far, in order
    pub fn audit(&self) -> &[AuditEvent] {
        &self.audit
    }

    pub fn clear_audit(&mut self) {
        self.audit.clear();
    }

    /// Makes the next `count` delegation calls fail with `Denied`
    pub fn deny_next_delegations(&mut self, count: usize) {
        self.deny_delegations = count;
    }

    /// Makes the next `count` scheduling-context creations fail
    pub fn deny_next_scheduling_contexts(&mut self, count: usize) {
        self.deny_sched_contexts = count;
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn sched_count(&self) -> usize {
        self.scheds.len()
    }

    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }

    pub fn semaphore_count(&self) -> usize {
        self.semaphores.len()
    }

    /// Current counter of a semaphore, if it exists
    pub fn semaphore_value(&self, sem: SemaphoreCap) -> Option<u64> {
        self.semaphores.get(&sem).copied()
    }

    /// CPU a context was created for, if it exists
    pub fn context_cpu(&self, context: ExecContextCap) -> Option<usize> {
        self.contexts.get(&context).map(|c| c.cpu)
    }

    /// Entry address a context was created with, if it exists
    pub fn context_entry(&self, context: ExecContextCap) -> Option<u64> {
        self.contexts.get(&context).map(|c| c.entry)
    }

    /// Domain a context belongs to, if it exists
    pub fn context_domain(&self, context: ExecContextCap) -> Option<DomainCap> {
        self.contexts.get(&context).map(|c| c.domain)
    }

    /// Ranges revoked so far, in order
    pub fn revocations(&self) -> Vec<CapRange> {
        self.audit
            .iter()
            .filter_map(|event| match event {
                AuditEvent::Revoked { range } => Some(*range),
                _ => None,
            })
            .collect()
    }

    /// Ranges delegated so far, in order, with their targets
    pub fn delegations(&self) -> Vec<(DomainCap, CapRange)> {
        self.audit
            .iter()
            .filter_map(|event| match event {
                AuditEvent::Delegated { target, range } => Some((*target, *range)),
                _ => None,
            })
            .collect()
    }

    /// True when no kernel objects remain
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
            && self.contexts.is_empty()
            && self.scheds.is_empty()
            && self.portals.is_empty()
            && self.semaphores.is_empty()
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelInterface for SimulatedKernel {
    fn create_isolation_domain(&mut self) -> Result<DomainCap, KernelError> {
        let domain = DomainCap::new();
        self.domains.insert(domain, Vec::new());
        Ok(domain)
    }

    fn create_execution_context(
        &mut self,
        domain: DomainCap,
        cpu: usize,
        entry: u64,
    ) -> Result<ExecContextCap, KernelError> {
        if !self.domains.contains_key(&domain) {
            return Err(KernelError::InvalidCapability(domain.to_string()));
        }
        let context = ExecContextCap::new();
        self.contexts
            .insert(context, ContextState { domain, cpu, entry });
        Ok(context)
    }

    fn create_scheduling_context(
        &mut self,
        context: ExecContextCap,
        _qpd: Qpd,
    ) -> Result<SchedContextCap, KernelError> {
        if self.deny_sched_contexts > 0 {
            self.deny_sched_contexts -= 1;
            return Err(KernelError::Denied);
        }
        if !self.contexts.contains_key(&context) {
            return Err(KernelError::InvalidCapability(context.to_string()));
        }
        let sched = SchedContextCap::new();
        self.scheds.insert(sched, context);
        Ok(sched)
    }

    fn create_portal(&mut self, domain: DomainCap) -> Result<PortalId, KernelError> {
        let Some(portals) = self.domains.get_mut(&domain) else {
            return Err(KernelError::InvalidCapability(domain.to_string()));
        };
        let portal = PortalId::new();
        portals.push(portal);
        self.portals.insert(portal, domain);
        Ok(portal)
    }

    fn create_semaphore(&mut self, initial: u64) -> Result<SemaphoreCap, KernelError> {
        let sem = SemaphoreCap::new();
        self.semaphores.insert(sem, initial);
        Ok(sem)
    }

    fn semaphore_up(&mut self, sem: SemaphoreCap) -> Result<(), KernelError> {
        let Some(count) = self.semaphores.get_mut(&sem) else {
            return Err(KernelError::ObjectNotFound);
        };
        *count += 1;
        self.audit.push(AuditEvent::SemaphoreSignalled { sem });
        Ok(())
    }

    fn semaphore_down(&mut self, sem: SemaphoreCap) -> Result<bool, KernelError> {
        let Some(count) = self.semaphores.get_mut(&sem) else {
            return Err(KernelError::ObjectNotFound);
        };
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        self.audit.push(AuditEvent::SemaphoreConsumed { sem });
        Ok(true)
    }

    fn delegate(&mut self, target: DomainCap, range: CapRange) -> Result<(), KernelError> {
        if self.deny_delegations > 0 {
            self.deny_delegations -= 1;
            return Err(KernelError::Denied);
        }
        if !self.domains.contains_key(&target) {
            return Err(KernelError::InvalidCapability(target.to_string()));
        }
        self.audit.push(AuditEvent::Delegated { target, range });
        Ok(())
    }

    fn revoke(&mut self, range: CapRange) -> Result<(), KernelError> {
        self.audit.push(AuditEvent::Revoked { range });
        Ok(())
    }

    fn release_isolation_domain(&mut self, domain: DomainCap) -> Result<(), KernelError> {
        self.domains
            .remove(&domain)
            .ok_or(KernelError::ObjectNotFound)?;
        self.audit.push(AuditEvent::DomainReleased { domain });
        Ok(())
    }

    fn release_execution_context(&mut self, context: ExecContextCap) -> Result<(), KernelError> {
        self.contexts
            .remove(&context)
            .ok_or(KernelError::ObjectNotFound)?;
        self.audit.push(AuditEvent::ContextReleased { context });
        Ok(())
    }

    fn release_scheduling_context(&mut self, context: SchedContextCap) -> Result<(), KernelError> {
        self.scheds
            .remove(&context)
            .ok_or(KernelError::ObjectNotFound)?;
        self.audit.push(AuditEvent::SchedReleased { context });
        Ok(())
    }

    fn release_portal(&mut self, portal: PortalId) -> Result<(), KernelError> {
        let domain = self
            .portals
            .remove(&portal)
            .ok_or(KernelError::ObjectNotFound)?;
        if let Some(portals) = self.domains.get_mut(&domain) {
            portals.retain(|p| *p != portal);
        }
        self.audit.push(AuditEvent::PortalReleased { portal });
        Ok(())
    }

    fn release_semaphore(&mut self, sem: SemaphoreCap) -> Result<(), KernelError> {
        self.semaphores
            .remove(&sem)
            .ok_or(KernelError::ObjectNotFound)?;
        self.audit.push(AuditEvent::SemaphoreReleased { sem });
        Ok(())
    }
}
