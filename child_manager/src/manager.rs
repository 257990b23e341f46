//! Child table, portal dispatch and the destruction protocol.

use crate::boot::{terminate_cmdline, BootInfo, BOOT_INFO_ADDR};
use crate::child::{Child, ChildState, ExecContext, Wakeup};
use crate::diag::{LogEntry, LogLevel, SupervisorLog};
use crate::region_list::{RegionError, RegionList};
use cap_types::{
    CapKind, CapRange, ChildId, DomainCap, ExecContextCap, PortalId, Rights, SchedContextCap,
    SemaphoreCap, PAGE_SHIFT, PAGE_SIZE,
};
use elf_loader::{load_image, LoadError};
use ipc::{plan_transfer, IpcError, MessageBuffer, TypedItem, TypedPayload};
use kernel_api::{KernelError, KernelInterface, Qpd};
use resources::UnitAllocator;
use service_registry::ServiceRegistry;
use std::collections::HashMap;
use thiserror::Error;

/// Capacity of the child table
pub const MAX_CHILDREN: usize = 32;

/// Bytes of stack given to every child
pub const STACK_SIZE: u64 = 4 * PAGE_SIZE;

/// Virtual address of the per-task control block.
///
/// The kernel maps the control block itself when the execution context
/// is created, so it never appears in the child's region map.
pub const CONTROL_BLOCK_ADDR: u64 = 0x7FFF_F000;

/// Source address of the read-only boot-information page
const BOOT_INFO_SOURCE: u64 = 0xB000_0000;

/// Source address space carved out for child stacks
const STACK_SOURCE_BASE: u64 = 0x1_0000_0000;

/// First word of an I/O-port or interrupt call: allocate
pub const RESOURCE_ALLOC: u64 = 0;
/// First word of an I/O-port or interrupt call: release
pub const RESOURCE_RELEASE: u64 = 1;

/// The operations a child can invoke on the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalOp {
    Startup,
    InitCaps,
    Register,
    Unregister,
    GetService,
    PageFault,
    IoPorts,
    Irq,
    Map,
    Unmap,
}

impl PortalOp {
    /// Every operation, in portal-creation order
    pub const ALL: [PortalOp; 10] = [
        PortalOp::Startup,
        PortalOp::InitCaps,
        PortalOp::Register,
        PortalOp::Unregister,
        PortalOp::GetService,
        PortalOp::PageFault,
        PortalOp::IoPorts,
        PortalOp::Irq,
        PortalOp::Map,
        PortalOp::Unmap,
    ];
}

/// What one portal identity resolves to.
///
/// The caller's identity arrives as an opaque portal id; this table entry
/// recovers the child, the CPU the call came from, and the operation,
/// with no assumptions about slot layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalBinding {
    pub child: ChildId,
    pub cpu: usize,
    pub op: PortalOp,
}

/// Errors for supervisor operations
#[derive(Debug, Error)]
pub enum ChildManagerError {
    #[error("child table full")]
    TableFull,

    #[error("caller identity does not name a known portal")]
    UnknownPortal,

    #[error("portal invoked for the wrong operation")]
    WrongOperation,

    #[error("child no longer exists")]
    UnknownChild,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Region(#[from] RegionError),
}

/// The architecture-neutral slice of a context's register frame that the
/// startup protocol rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFrame {
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub frame_pointer: u64,
    /// Argument registers handed to the child's entry point
    pub args: [u64; 4],
}

/// What the kernel reports about a page fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub address: u64,
    pub instruction_pointer: u64,
    pub frame_pointer: u64,
}

/// How a page fault was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// One page was delegated and marked mapped
    Resolved,
    /// The fault was unresolvable; the faulting context's reference was
    /// dropped
    Terminated {
        /// Whether that was the last reference and the child is gone
        child_destroyed: bool,
    },
}

enum Created {
    Domain(DomainCap),
    Context(ExecContextCap),
    Sched(SchedContextCap),
    Portal(PortalId),
    Semaphore(SemaphoreCap),
}

/// Accumulates kernel objects for a child under construction.
///
/// Dropping the builder before [`ChildBuilder::commit`] releases every
/// created object in reverse creation order, so a failed load can never
/// leak. Release failures during unwind are ignored; the objects were
/// never visible outside the builder.
struct ChildBuilder<'k, K: KernelInterface> {
    kernel: &'k mut K,
    created: Vec<Created>,
    committed: bool,
}

impl<'k, K: KernelInterface> ChildBuilder<'k, K> {
    fn new(kernel: &'k mut K) -> Self {
        Self {
            kernel,
            created: Vec::new(),
            committed: false,
        }
    }

    fn isolation_domain(&mut self) -> Result<DomainCap, KernelError> {
        let domain = self.kernel.create_isolation_domain()?;
        self.created.push(Created::Domain(domain));
        Ok(domain)
    }

    fn execution_context(
        &mut self,
        domain: DomainCap,
        cpu: usize,
        entry: u64,
    ) -> Result<ExecContextCap, KernelError> {
        let context = self.kernel.create_execution_context(domain, cpu, entry)?;
        self.created.push(Created::Context(context));
        Ok(context)
    }

    fn scheduling_context(
        &mut self,
        context: ExecContextCap,
        qpd: Qpd,
    ) -> Result<SchedContextCap, KernelError> {
        let sched = self.kernel.create_scheduling_context(context, qpd)?;
        self.created.push(Created::Sched(sched));
        Ok(sched)
    }

    fn portal(&mut self, domain: DomainCap) -> Result<PortalId, KernelError> {
        let portal = self.kernel.create_portal(domain)?;
        self.created.push(Created::Portal(portal));
        Ok(portal)
    }

    fn semaphore(&mut self, initial: u64) -> Result<SemaphoreCap, KernelError> {
        let sem = self.kernel.create_semaphore(initial)?;
        self.created.push(Created::Semaphore(sem));
        Ok(sem)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<K: KernelInterface> Drop for ChildBuilder<'_, K> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for created in self.created.drain(..).rev() {
            let _ = match created {
                Created::Domain(domain) => self.kernel.release_isolation_domain(domain),
                Created::Context(context) => self.kernel.release_execution_context(context),
                Created::Sched(sched) => self.kernel.release_scheduling_context(sched),
                Created::Portal(portal) => self.kernel.release_portal(portal),
                Created::Semaphore(sem) => self.kernel.release_semaphore(sem),
            };
        }
    }
}

/// The root supervisor: owns the child table, the portal bindings, the
/// service registry and the resource allocators.
///
/// Every mutating operation takes `&mut self`, which realizes the
/// at-most-one-concurrent-mutation discipline: a caller that wants
/// parallel dispatch must serialize access around the manager as a whole.
pub struct ChildManager {
    children: HashMap<ChildId, Child>,
    bindings: HashMap<PortalId, PortalBinding>,
    registry: ServiceRegistry,
    ports: UnitAllocator,
    irqs: UnitAllocator,
    cpu_count: usize,
    next_stack_source: u64,
    log: SupervisorLog,
}

impl ChildManager {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            children: HashMap::new(),
            bindings: HashMap::new(),
            registry: ServiceRegistry::new(),
            ports: UnitAllocator::ports(),
            irqs: UnitAllocator::irqs(),
            cpu_count,
            next_stack_source: STACK_SOURCE_BASE,
            log: SupervisorLog::new(),
        }
    }

    /// Marks an I/O-port span as owned by the platform, never handed out
    pub fn reserve_ports(&mut self, base: u64, count: u64) -> Result<(), resources::ResourceError> {
        self.ports.reserve(base, count)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn child(&self, id: ChildId) -> Option<&Child> {
        self.children.get(&id)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn log(&self) -> &SupervisorLog {
        &self.log
    }

    /// The portal a child would invoke for `op` from `cpu`
    pub fn portal(&self, child: ChildId, cpu: usize, op: PortalOp) -> Option<PortalId> {
        self.bindings
            .iter()
            .find(|(_, b)| b.child == child && b.cpu == cpu && b.op == op)
            .map(|(portal, _)| *portal)
    }

    /// Loads every boot module except the first (the supervisor itself).
    ///
    /// A module that fails to load is logged and skipped; the remaining
    /// modules still start.
    pub fn start_children<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        boot: &BootInfo,
    ) -> Vec<ChildId> {
        let mut started = Vec::new();
        for module in boot.modules.iter().skip(1) {
            let cmdline = terminate_cmdline(&module.cmdline);
            match self.load(kernel, &module.image, &cmdline, module.phys_addr) {
                Ok(id) => started.push(id),
                Err(err) => self.log.record(
                    LogEntry::new(LogLevel::Warn, "boot module failed to load")
                        .with_field("cmdline", cmdline)
                        .with_field("error", err.to_string()),
                ),
            }
        }
        started
    }

    /// Validates `image` and brings up a new child.
    ///
    /// The scheduling context is created last; it is the point at which
    /// the child becomes runnable, so every other field must be in place
    /// first. Any failure unwinds completely: no table entry, no portal
    /// binding, no kernel object survives a failed load.
    pub fn load<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        image: &[u8],
        cmdline: &str,
        phys_addr: u64,
    ) -> Result<ChildId, ChildManagerError> {
        if self.children.len() == MAX_CHILDREN {
            return Err(ChildManagerError::TableFull);
        }
        let staged = load_image(image)?;

        let mut regions = RegionList::new();
        for segment in &staged.segments {
            regions.add(
                segment.virt,
                segment.mem_size,
                phys_addr + segment.offset,
                segment.perms,
            )?;
        }
        // the fixed boot-info page goes in first so the stack search
        // cannot place a span across it
        regions.add(
            BOOT_INFO_ADDR,
            PAGE_SIZE,
            BOOT_INFO_SOURCE,
            Rights::read_only(),
        )?;
        let stack_base = regions.find_free(STACK_SIZE);
        let stack_source = self.next_stack_source;
        regions.add(stack_base, STACK_SIZE, stack_source, Rights::read_write())?;

        let mut builder = ChildBuilder::new(kernel);
        let domain = builder.isolation_domain()?;

        let mut portal_plan = Vec::with_capacity(self.cpu_count * PortalOp::ALL.len());
        for cpu in 0..self.cpu_count {
            for op in PortalOp::ALL {
                portal_plan.push((builder.portal(domain)?, cpu, op));
            }
        }
        let context = builder.execution_context(domain, 0, staged.entry)?;
        let mut wakeups = HashMap::new();
        for cpu in 0..self.cpu_count {
            wakeups.insert(
                cpu,
                Wakeup {
                    sem: builder.semaphore(0)?,
                    pending: 0,
                },
            );
        }

        let id = ChildId::new();
        self.children.insert(
            id,
            Child {
                id,
                cmdline: cmdline.to_string(),
                state: ChildState::Loading,
                domain,
                sched: None,
                entry: staged.entry,
                contexts: vec![ExecContext {
                    cap: context,
                    cpu: 0,
                    started: false,
                }],
                portals: portal_plan.iter().map(|(portal, _, _)| *portal).collect(),
                regions,
                stack_base,
                stack_bytes: vec![0; STACK_SIZE as usize],
                control_block: CONTROL_BLOCK_ADDR,
                boot_info: BOOT_INFO_ADDR,
                refs: 1,
                wakeups,
            },
        );

        let sched = match builder.scheduling_context(context, Qpd::default()) {
            Ok(sched) => sched,
            Err(err) => {
                self.children.remove(&id);
                return Err(err.into());
            }
        };
        builder.commit();
        self.next_stack_source = stack_source + STACK_SIZE;

        for (portal, cpu, op) in portal_plan {
            self.bindings.insert(portal, PortalBinding { child: id, cpu, op });
        }
        if let Some(child) = self.children.get_mut(&id) {
            child.sched = Some(sched);
            child.state = ChildState::Running;
        }
        self.log.record(
            LogEntry::new(LogLevel::Info, "child loaded")
                .with_source(id)
                .with_field("cmdline", cmdline)
                .with_field("entry", format!("{:#x}", staged.entry)),
        );
        Ok(id)
    }

    fn expect(&self, portal: PortalId, op: PortalOp) -> Result<PortalBinding, ChildManagerError> {
        let binding = self
            .bindings
            .get(&portal)
            .copied()
            .ok_or(ChildManagerError::UnknownPortal)?;
        if binding.op != op {
            return Err(ChildManagerError::WrongOperation);
        }
        Ok(binding)
    }

    /// Rewrites a freshly created context's register frame.
    ///
    /// Honored only for the first invocation per execution context; a
    /// repeated call leaves the frame untouched.
    pub fn handle_startup(
        &mut self,
        portal: PortalId,
        frame: &mut RegisterFrame,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::Startup)?;
        let child = self
            .children
            .get_mut(&binding.child)
            .ok_or(ChildManagerError::UnknownChild)?;
        let (entry, stack_base, boot_info, control_block) =
            (child.entry, child.stack_base, child.boot_info, child.control_block);
        let context = child
            .context_on_mut(binding.cpu)
            .ok_or(ChildManagerError::UnknownChild)?;
        if context.started {
            return Ok(());
        }
        // the stack pointer keeps its page offset, rebased onto the
        // child's stack region
        frame.stack_pointer = stack_base + (frame.stack_pointer & (PAGE_SIZE - 1));
        frame.instruction_pointer = entry;
        frame.args = [binding.cpu as u64, boot_info, control_block, 1];
        context.started = true;
        Ok(())
    }

    /// Delegates the child's own domain, execution-context and
    /// scheduling-context capabilities back to it.
    pub fn handle_init_caps(
        &mut self,
        portal: PortalId,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::InitCaps)?;
        let child = self
            .children
            .get(&binding.child)
            .ok_or(ChildManagerError::UnknownChild)?;
        reply.clear();
        reply.delegate_object(child.domain.into())?;
        if let Some(context) = child.context_on(binding.cpu).or_else(|| child.contexts.first()) {
            reply.delegate_object(context.cap.into())?;
        }
        if let Some(sched) = child.sched {
            reply.delegate_object(sched.into())?;
        }
        Ok(())
    }

    /// `register(capability, name) -> bool`
    pub fn handle_register(
        &mut self,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::Register)?;
        if !self.children.contains_key(&binding.child) {
            return Err(ChildManagerError::UnknownChild);
        }
        reply.clear();
        let cap = match call.take_typed() {
            Ok(TypedItem {
                payload: TypedPayload::Object(cap),
                ..
            }) => cap,
            _ => {
                reply.push_word(0)?;
                return Ok(());
            }
        };
        let Ok(name) = call.take_str() else {
            reply.push_word(0)?;
            return Ok(());
        };
        match self.registry.register(&name, cap, binding.child) {
            Ok(()) => {
                self.log.record(
                    LogEntry::new(LogLevel::Info, "service registered")
                        .with_source(binding.child)
                        .with_field("name", name),
                );
                reply.push_word(1)?;
            }
            Err(err) => {
                self.log.record(
                    LogEntry::new(LogLevel::Warn, "service registration refused")
                        .with_source(binding.child)
                        .with_field("name", name)
                        .with_field("error", err.to_string()),
                );
                reply.push_word(0)?;
            }
        }
        Ok(())
    }

    /// `unregister(name) -> bool`; only the registering child may withdraw
    pub fn handle_unregister(
        &mut self,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::Unregister)?;
        reply.clear();
        let Ok(name) = call.take_str() else {
            reply.push_word(0)?;
            return Ok(());
        };
        let word = match self.registry.unregister(&name, binding.child) {
            Ok(()) => 1,
            Err(_) => 0,
        };
        reply.push_word(word)?;
        Ok(())
    }

    /// `get_service(name) -> capability | none`
    pub fn handle_get_service(
        &mut self,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        self.expect(portal, PortalOp::GetService)?;
        reply.clear();
        let Ok(name) = call.take_str() else {
            reply.push_word(0)?;
            return Ok(());
        };
        match self.registry.lookup(&name) {
            Ok(cap) => {
                reply.delegate_object(cap)?;
                reply.push_word(1)?;
            }
            Err(_) => {
                reply.push_word(0)?;
            }
        }
        Ok(())
    }

    /// Resolves a page fault, or terminates the faulting context.
    ///
    /// A fault is resolvable when a region covers the address and the
    /// containing page was never delegated; exactly one page moves per
    /// fault and each page moves at most once, so stale faults can never
    /// loop. Diagnostics are recorded before any destructive action.
    pub fn handle_page_fault<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        portal: PortalId,
        fault: &FaultInfo,
        reply: &mut MessageBuffer,
    ) -> Result<FaultOutcome, ChildManagerError> {
        let binding = self.expect(portal, PortalOp::PageFault)?;
        let child = self
            .children
            .get_mut(&binding.child)
            .ok_or(ChildManagerError::UnknownChild)?;
        let page = fault.address & !(PAGE_SIZE - 1);

        if let Some(hit) = child.regions.find(fault.address) {
            if !hit.mapped {
                reply.clear();
                let frame = CapRange::new(
                    CapKind::Memory,
                    hit.source_page >> PAGE_SHIFT,
                    1,
                    hit.perms,
                )
                .with_hotspot(page >> PAGE_SHIFT);
                reply.delegate_range(frame)?;
                child.regions.mark_mapped(fault.address);
                return Ok(FaultOutcome::Resolved);
            }
        }

        child.state = ChildState::Faulting;
        let mut entry = LogEntry::new(LogLevel::Error, "unresolvable page fault")
            .with_source(binding.child)
            .with_field("cmdline", child.cmdline.clone())
            .with_field("address", format!("{:#x}", fault.address))
            .with_field("ip", format!("{:#x}", fault.instruction_pointer));
        for (depth, ret) in child.backtrace(fault.frame_pointer).iter().enumerate() {
            entry = entry.with_field(format!("frame{depth}"), format!("{ret:#x}"));
        }
        self.log.record(entry);

        let child_destroyed = self.drop_context_reference(kernel, binding.child)?;
        Ok(FaultOutcome::Terminated { child_destroyed })
    }

    fn resource_call<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        binding: PortalBinding,
        kind: CapKind,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        reply.clear();
        let (op, base, count) = match (call.take_word(), call.take_word(), call.take_word()) {
            (Ok(op), Ok(base), Ok(count)) => (op, base, count),
            _ => {
                reply.push_word(0)?;
                return Ok(());
            }
        };
        let allocate = |manager: &mut Self, base, count| match kind {
            CapKind::IoPort => manager.ports.allocate(base, count),
            _ => manager.irqs.allocate(base, count),
        };
        let release = |manager: &mut Self, base, count| match kind {
            CapKind::IoPort => manager.ports.release(base, count),
            _ => manager.irqs.release(base, count),
        };
        match op {
            RESOURCE_ALLOC => match allocate(self, base, count) {
                Ok(()) => {
                    reply.delegate_range(
                        CapRange::new(kind, base, count, Rights::full()).with_hotspot(base),
                    )?;
                    reply.push_word(1)?;
                }
                Err(err) => {
                    self.log.record(
                        LogEntry::new(LogLevel::Warn, "resource allocation refused")
                            .with_source(binding.child)
                            .with_field("error", err.to_string()),
                    );
                    reply.push_word(0)?;
                }
            },
            RESOURCE_RELEASE => match release(self, base, count) {
                Ok(()) => {
                    // revocation accepts only aligned spans
                    let whole = CapRange::new(kind, base, count, Rights::full());
                    for block in whole.aligned_blocks() {
                        kernel.revoke(CapRange::new(kind, block.base, block.len(), Rights::full()))?;
                    }
                    reply.push_word(1)?;
                }
                Err(err) => {
                    self.log.record(
                        LogEntry::new(LogLevel::Warn, "resource release refused")
                            .with_source(binding.child)
                            .with_field("error", err.to_string()),
                    );
                    reply.push_word(0)?;
                }
            },
            _ => {
                reply.push_word(0)?;
            }
        }
        Ok(())
    }

    /// `io_ports(op, base, count)`; release also revokes granted access
    pub fn handle_io_ports<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::IoPorts)?;
        self.resource_call(kernel, binding, CapKind::IoPort, call, reply)
    }

    /// `irq(op, line, count)`; interrupt lines are object selectors
    pub fn handle_irq<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::Irq)?;
        self.resource_call(kernel, binding, CapKind::Object, call, reply)
    }

    /// `map(frame_base, count, dest_page) -> bool`
    ///
    /// A misaligned bulk mapping is split by the batch planner; a kernel
    /// denial anywhere aborts the whole transfer and the child sees a
    /// single failure word.
    pub fn handle_map<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        let binding = self.expect(portal, PortalOp::Map)?;
        let domain = self
            .children
            .get(&binding.child)
            .ok_or(ChildManagerError::UnknownChild)?
            .domain;
        reply.clear();
        let (frame_base, count, dest) = match (call.take_word(), call.take_word(), call.take_word())
        {
            (Ok(f), Ok(c), Ok(d)) => (f, c, d),
            _ => {
                reply.push_word(0)?;
                return Ok(());
            }
        };
        if count == 0 {
            reply.push_word(0)?;
            return Ok(());
        }
        let range =
            CapRange::new(CapKind::Memory, frame_base, count, Rights::read_write()).with_hotspot(dest);
        for chunk in plan_transfer(&range, reply.free_typed_items()) {
            if let Err(err) = kernel.delegate(domain, chunk) {
                self.log.record(
                    LogEntry::new(LogLevel::Warn, "memory map denied")
                        .with_source(binding.child)
                        .with_field("error", err.to_string()),
                );
                reply.clear();
                reply.push_word(0)?;
                return Ok(());
            }
        }
        reply.push_word(1)?;
        Ok(())
    }

    /// `unmap(frame_base, count) -> bool`
    pub fn handle_unmap<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        portal: PortalId,
        call: &mut MessageBuffer,
        reply: &mut MessageBuffer,
    ) -> Result<(), ChildManagerError> {
        self.expect(portal, PortalOp::Unmap)?;
        reply.clear();
        let (frame_base, count) = match (call.take_word(), call.take_word()) {
            (Ok(f), Ok(c)) => (f, c),
            _ => {
                reply.push_word(0)?;
                return Ok(());
            }
        };
        if count == 0 {
            reply.push_word(0)?;
            return Ok(());
        }
        let whole = CapRange::new(CapKind::Memory, frame_base, count, Rights::read_write());
        for block in whole.aligned_blocks() {
            kernel.revoke(CapRange::new(
                CapKind::Memory,
                block.base,
                block.len(),
                Rights::read_write(),
            ))?;
        }
        reply.push_word(1)?;
        Ok(())
    }

    /// A context of `child` wants to wait on `cpu`'s resource.
    ///
    /// An already-signalled wakeup is consumed immediately and the
    /// context does not park; the call then returns `true`. Otherwise
    /// the wait is recorded and the next [`ChildManager::notify`] for
    /// `cpu` signals it.
    pub fn record_wait<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        child: ChildId,
        cpu: usize,
    ) -> Result<bool, ChildManagerError> {
        let child = self
            .children
            .get_mut(&child)
            .ok_or(ChildManagerError::UnknownChild)?;
        if let Some(wakeup) = child.wakeups.get_mut(&cpu) {
            if kernel.semaphore_down(wakeup.sem)? {
                return Ok(true);
            }
            wakeup.pending += 1;
        }
        Ok(false)
    }

    /// Wakes every context of every child parked on `cpu`'s resource,
    /// draining each pending counter to zero.
    pub fn notify<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        cpu: usize,
    ) -> Result<(), ChildManagerError> {
        for child in self.children.values_mut() {
            if let Some(wakeup) = child.wakeups.get_mut(&cpu) {
                while wakeup.pending > 0 {
                    kernel.semaphore_up(wakeup.sem)?;
                    wakeup.pending -= 1;
                }
            }
        }
        Ok(())
    }

    /// Creates an additional execution context for `child` on `cpu`,
    /// raising the reference count.
    pub fn add_execution_context<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        child: ChildId,
        cpu: usize,
    ) -> Result<ExecContextCap, ChildManagerError> {
        let child = self
            .children
            .get_mut(&child)
            .ok_or(ChildManagerError::UnknownChild)?;
        let context = kernel.create_execution_context(child.domain, cpu, child.entry)?;
        child.contexts.push(ExecContext {
            cap: context,
            cpu,
            started: false,
        });
        child.refs += 1;
        Ok(context)
    }

    /// A context of `child` exited voluntarily; drops its reference.
    ///
    /// Returns whether that was the last reference.
    pub fn context_exited<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        child: ChildId,
    ) -> Result<bool, ChildManagerError> {
        self.drop_context_reference(kernel, child)
    }

    /// Drops one execution-context reference; tears the child down when
    /// the count reaches zero.
    ///
    /// A caller that observes a non-zero count must not touch the child
    /// again; the table entry stays valid for the surviving contexts.
    fn drop_context_reference<K: KernelInterface>(
        &mut self,
        kernel: &mut K,
        id: ChildId,
    ) -> Result<bool, ChildManagerError> {
        let child = self
            .children
            .get_mut(&id)
            .ok_or(ChildManagerError::UnknownChild)?;
        child.refs -= 1;
        if child.refs > 0 {
            return Ok(false);
        }

        let mut child = match self.children.remove(&id) {
            Some(child) => child,
            None => return Ok(false),
        };
        child.state = ChildState::Destroyed;
        self.bindings.retain(|_, binding| binding.child != id);
        let removed = self.registry.remove_owner(id);

        // teardown is best effort; a failed release is logged, never fatal
        if let Some(sched) = child.sched {
            if let Err(err) = kernel.release_scheduling_context(sched) {
                self.warn_release(id, "scheduling context", err);
            }
        }
        for wakeup in child.wakeups.values() {
            if let Err(err) = kernel.release_semaphore(wakeup.sem) {
                self.warn_release(id, "semaphore", err);
            }
        }
        for context in &child.contexts {
            if let Err(err) = kernel.release_execution_context(context.cap) {
                self.warn_release(id, "execution context", err);
            }
        }
        for portal in &child.portals {
            if let Err(err) = kernel.release_portal(*portal) {
                self.warn_release(id, "portal", err);
            }
        }
        if let Err(err) = kernel.release_isolation_domain(child.domain) {
            self.warn_release(id, "isolation domain", err);
        }

        self.log.record(
            LogEntry::new(LogLevel::Info, "child destroyed")
                .with_source(id)
                .with_field("cmdline", child.cmdline)
                .with_field("services_removed", removed.to_string()),
        );
        Ok(true)
    }

    fn warn_release(&mut self, id: ChildId, what: &str, err: KernelError) {
        self.log.record(
            LogEntry::new(LogLevel::Warn, "release failed during teardown")
                .with_source(id)
                .with_field("object", what)
                .with_field("error", err.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::BootModule;
    use crate::region_list::FREE_BASE;
    use cap_types::ObjectRef;
    use elf_loader::testing::ImageBuilder;
    use sim_kernel::SimulatedKernel;

    const PAGE: usize = PAGE_SIZE as usize;
    const MODULE_PHYS: u64 = 0x10_0000;

    fn two_segment_image() -> Vec<u8> {
        ImageBuilder::new(0x40_0000)
            .segment(0x40_0000, ImageBuilder::rx(), vec![0x90; 2 * PAGE])
            .segment(0x40_2000, ImageBuilder::rw(), vec![0; PAGE])
            .build()
    }

    fn loaded(cpu_count: usize) -> (ChildManager, SimulatedKernel, ChildId) {
        let mut manager = ChildManager::new(cpu_count);
        let mut kernel = SimulatedKernel::new();
        let id = manager
            .load(&mut kernel, &two_segment_image(), "hello", MODULE_PHYS)
            .unwrap();
        (manager, kernel, id)
    }

    #[test]
    fn test_load_builds_regions_and_portals() {
        let (manager, kernel, id) = loaded(2);
        let child = manager.child(id).unwrap();
        // two segments, the stack, the boot-info page
        assert_eq!(child.regions.len(), 4);
        assert_eq!(child.state, ChildState::Running);
        assert_eq!(child.stack_base, FREE_BASE);
        assert_eq!(child.refs, 1);
        assert_eq!(manager.bindings.len(), PortalOp::ALL.len() * 2);
        assert_eq!(kernel.domain_count(), 1);
        assert_eq!(kernel.portal_count(), PortalOp::ALL.len() * 2);
        assert_eq!(kernel.context_count(), 1);
        assert_eq!(kernel.sched_count(), 1);
        assert_eq!(kernel.semaphore_count(), 2);
        assert_eq!(kernel.context_entry(child.contexts[0].cap), Some(0x40_0000));
    }

    #[test]
    fn test_malformed_image_leaves_no_trace() {
        let mut manager = ChildManager::new(1);
        let mut kernel = SimulatedKernel::new();
        let result = manager.load(&mut kernel, &[0u8; 10], "broken", MODULE_PHYS);
        assert!(matches!(
            result,
            Err(ChildManagerError::Load(LoadError::ImageTooSmall))
        ));
        assert_eq!(manager.child_count(), 0);
        assert!(kernel.is_empty());
    }

    #[test]
    fn test_denied_scheduling_context_unwinds_everything() {
        let mut manager = ChildManager::new(2);
        let mut kernel = SimulatedKernel::new();
        kernel.deny_next_scheduling_contexts(1);
        let result = manager.load(&mut kernel, &two_segment_image(), "hello", MODULE_PHYS);
        assert!(matches!(
            result,
            Err(ChildManagerError::Kernel(KernelError::Denied))
        ));
        assert_eq!(manager.child_count(), 0);
        assert_eq!(manager.bindings.len(), 0);
        assert!(kernel.is_empty());
        // reverse unwind: the domain was created first, released last
        assert!(matches!(
            kernel.audit().last(),
            Some(sim_kernel::AuditEvent::DomainReleased { .. })
        ));
    }

    #[test]
    fn test_startup_rewrites_frame_exactly_once() {
        let (mut manager, _kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::Startup).unwrap();
        let mut frame = RegisterFrame {
            stack_pointer: 0xdead_b123,
            ..RegisterFrame::default()
        };
        manager.handle_startup(portal, &mut frame).unwrap();
        assert_eq!(frame.stack_pointer, FREE_BASE + 0x123);
        assert_eq!(frame.instruction_pointer, 0x40_0000);
        assert_eq!(frame.args, [0, BOOT_INFO_ADDR, CONTROL_BLOCK_ADDR, 1]);

        let mut second = RegisterFrame {
            stack_pointer: 0xffff_0456,
            ..RegisterFrame::default()
        };
        manager.handle_startup(portal, &mut second).unwrap();
        assert_eq!(second.stack_pointer, 0xffff_0456, "second startup must not rewrite");
    }

    #[test]
    fn test_init_caps_delegates_own_handles() {
        let (mut manager, _kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::InitCaps).unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_init_caps(portal, &mut reply).unwrap();
        // domain, execution context, scheduling context
        assert_eq!(reply.typed_items().len(), 3);
    }

    #[test]
    fn test_register_and_get_service_round_trip() {
        let (mut manager, _kernel, id) = loaded(1);
        let cap: ObjectRef = SemaphoreCap::new().into();

        let register = manager.portal(id, 0, PortalOp::Register).unwrap();
        let mut call = MessageBuffer::new();
        call.delegate_object(cap).unwrap();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_register(register, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));

        let lookup = manager.portal(id, 0, PortalOp::GetService).unwrap();
        let mut call = MessageBuffer::new();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_get_service(lookup, &mut call, &mut reply).unwrap();
        let item = reply.take_typed().unwrap();
        assert_eq!(item.payload, TypedPayload::Object(cap));
        assert_eq!(reply.take_word(), Ok(1));

        let mut call = MessageBuffer::new();
        call.push_str("printer").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_get_service(lookup, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(0));
        assert!(reply.typed_items().is_empty());
    }

    #[test]
    fn test_register_fails_closed_on_malformed_call() {
        let (mut manager, _kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::Register).unwrap();
        // no typed item, no name
        let mut call = MessageBuffer::new();
        let mut reply = MessageBuffer::new();
        manager.handle_register(portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(0));
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_unregister_is_owner_scoped() {
        let (mut manager, mut kernel, id) = loaded(1);
        let other = manager
            .load(&mut kernel, &two_segment_image(), "other", MODULE_PHYS + 0x10_0000)
            .unwrap();
        let cap: ObjectRef = SemaphoreCap::new().into();
        let register = manager.portal(id, 0, PortalOp::Register).unwrap();
        let mut call = MessageBuffer::new();
        call.delegate_object(cap).unwrap();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_register(register, &mut call, &mut reply).unwrap();

        // a different child cannot withdraw the service
        let foreign = manager.portal(other, 0, PortalOp::Unregister).unwrap();
        let mut call = MessageBuffer::new();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_unregister(foreign, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(0));
        assert_eq!(manager.registry().len(), 1);

        let own = manager.portal(id, 0, PortalOp::Unregister).unwrap();
        let mut call = MessageBuffer::new();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_unregister(own, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_page_fault_resolves_once_then_is_fatal() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::PageFault).unwrap();
        let fault = FaultInfo {
            address: 0x40_0004,
            instruction_pointer: 0x40_0004,
            frame_pointer: 0,
        };
        let mut reply = MessageBuffer::new();
        let outcome = manager
            .handle_page_fault(&mut kernel, portal, &fault, &mut reply)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Resolved);
        let item = reply.take_typed().unwrap();
        let TypedPayload::Range(range) = item.payload else {
            panic!("fault reply must carry a frame range");
        };
        assert_eq!(range.count(), 1);
        assert_eq!(range.hotspot(), Some(0x40_0000 >> PAGE_SHIFT));
        assert!(manager.child(id).unwrap().regions.find(0x40_0000).unwrap().mapped);

        // the same page can never be delegated twice
        let mut reply = MessageBuffer::new();
        let outcome = manager
            .handle_page_fault(&mut kernel, portal, &fault, &mut reply)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Terminated { child_destroyed: true });
        assert_eq!(manager.child_count(), 0);
        assert!(kernel.is_empty());
    }

    #[test]
    fn test_unresolvable_fault_logs_backtrace_and_destroys() {
        let (mut manager, mut kernel, id) = loaded(1);
        let stack_base = manager.child(id).unwrap().stack_base;
        {
            let child = manager.children.get_mut(&id).unwrap();
            let frame = |stack: &mut Vec<u8>, offset: usize, next: u64, ret: u64| {
                stack[offset..offset + 8].copy_from_slice(&next.to_le_bytes());
                stack[offset + 8..offset + 16].copy_from_slice(&ret.to_le_bytes());
            };
            frame(&mut child.stack_bytes, 0x100, stack_base + 0x200, 0x40_0042);
            frame(&mut child.stack_bytes, 0x200, 0, 0);
        }
        let portal = manager.portal(id, 0, PortalOp::PageFault).unwrap();
        let fault = FaultInfo {
            address: 0xdead_0000,
            instruction_pointer: 0x40_0042,
            frame_pointer: stack_base + 0x100,
        };
        let mut reply = MessageBuffer::new();
        let outcome = manager
            .handle_page_fault(&mut kernel, portal, &fault, &mut reply)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Terminated { child_destroyed: true });

        let diagnostic = manager
            .log()
            .entries()
            .iter()
            .find(|e| e.level == LogLevel::Error)
            .expect("fault diagnostic must be recorded");
        assert_eq!(diagnostic.source, Some(id));
        assert!(diagnostic
            .fields
            .iter()
            .any(|(k, v)| k == "frame0" && v == "0x400042"));
    }

    #[test]
    fn test_destruction_waits_for_every_reference() {
        let (mut manager, mut kernel, id) = loaded(2);
        manager.add_execution_context(&mut kernel, id, 1).unwrap();
        assert_eq!(manager.child(id).unwrap().refs, 2);

        let cap: ObjectRef = SemaphoreCap::new().into();
        let register = manager.portal(id, 0, PortalOp::Register).unwrap();
        let mut call = MessageBuffer::new();
        call.delegate_object(cap).unwrap();
        call.push_str("console").unwrap();
        let mut reply = MessageBuffer::new();
        manager.handle_register(register, &mut call, &mut reply).unwrap();

        let portal = manager.portal(id, 1, PortalOp::PageFault).unwrap();
        let fault = FaultInfo {
            address: 0xdead_0000,
            instruction_pointer: 0,
            frame_pointer: 0,
        };
        let mut reply = MessageBuffer::new();
        let outcome = manager
            .handle_page_fault(&mut kernel, portal, &fault, &mut reply)
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Terminated { child_destroyed: false });
        // the sibling context still sees the child and its services
        assert_eq!(manager.child(id).unwrap().state, ChildState::Faulting);
        assert!(manager.registry().lookup("console").is_ok());

        assert!(manager.context_exited(&mut kernel, id).unwrap());
        assert_eq!(manager.child_count(), 0);
        assert!(manager.registry().is_empty());
        assert!(kernel.is_empty());
    }

    #[test]
    fn test_port_release_revokes_minimal_aligned_spans() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::IoPorts).unwrap();

        let mut call = MessageBuffer::new();
        for word in [RESOURCE_ALLOC, 100, 5] {
            call.push_word(word).unwrap();
        }
        let mut reply = MessageBuffer::new();
        manager.handle_io_ports(&mut kernel, portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));
        assert_eq!(reply.typed_items().len(), 1);

        let mut call = MessageBuffer::new();
        for word in [RESOURCE_RELEASE, 100, 5] {
            call.push_word(word).unwrap();
        }
        let mut reply = MessageBuffer::new();
        manager.handle_io_ports(&mut kernel, portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));

        let mut revoked = Vec::new();
        for range in kernel.revocations() {
            assert_eq!(range.start() % range.count(), 0, "span crosses its alignment");
            revoked.extend(range.start()..range.start() + range.count());
        }
        assert_eq!(revoked, (100..105).collect::<Vec<_>>());
    }

    #[test]
    fn test_double_port_allocation_is_denied() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::IoPorts).unwrap();
        for expected in [1, 0] {
            let mut call = MessageBuffer::new();
            for word in [RESOURCE_ALLOC, 0x3f8, 8] {
                call.push_word(word).unwrap();
            }
            let mut reply = MessageBuffer::new();
            manager.handle_io_ports(&mut kernel, portal, &mut call, &mut reply).unwrap();
            assert_eq!(reply.take_word(), Ok(expected));
        }
    }

    #[test]
    fn test_map_delegates_whole_range_in_chunks() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::Map).unwrap();
        let mut call = MessageBuffer::new();
        // misaligned destination forces the batch planner to split
        for word in [0x100, 8, 0x101] {
            call.push_word(word).unwrap();
        }
        let mut reply = MessageBuffer::new();
        manager.handle_map(&mut kernel, portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));
        let total: u64 = kernel.delegations().iter().map(|(_, r)| r.count()).sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_denied_map_aborts_whole_transfer() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::Map).unwrap();
        kernel.deny_next_delegations(1);
        let mut call = MessageBuffer::new();
        for word in [0x100, 8, 0x205] {
            call.push_word(word).unwrap();
        }
        let mut reply = MessageBuffer::new();
        manager.handle_map(&mut kernel, portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(0));
        assert!(kernel.delegations().is_empty());
    }

    #[test]
    fn test_unmap_revokes_aligned_spans() {
        let (mut manager, mut kernel, id) = loaded(1);
        let portal = manager.portal(id, 0, PortalOp::Unmap).unwrap();
        let mut call = MessageBuffer::new();
        for word in [0x100, 8] {
            call.push_word(word).unwrap();
        }
        let mut reply = MessageBuffer::new();
        manager.handle_unmap(&mut kernel, portal, &mut call, &mut reply).unwrap();
        assert_eq!(reply.take_word(), Ok(1));
        assert_eq!(kernel.revocations().len(), 1);
        assert_eq!(kernel.revocations()[0].count(), 8);
    }

    #[test]
    fn test_notify_drains_pending_wakeups() {
        let (mut manager, mut kernel, id) = loaded(2);
        assert!(!manager.record_wait(&mut kernel, id, 0).unwrap());
        assert!(!manager.record_wait(&mut kernel, id, 0).unwrap());
        assert!(!manager.record_wait(&mut kernel, id, 1).unwrap());
        manager.notify(&mut kernel, 0).unwrap();

        let child = manager.child(id).unwrap();
        let sem_cpu0 = child.wakeups[&0].sem;
        let sem_cpu1 = child.wakeups[&1].sem;
        assert_eq!(kernel.semaphore_value(sem_cpu0), Some(2));
        assert_eq!(child.wakeups[&0].pending, 0);
        // a wakeup on CPU 0 must not wake CPU 1 waiters
        assert_eq!(kernel.semaphore_value(sem_cpu1), Some(0));
        assert_eq!(child.wakeups[&1].pending, 1);

        // draining is idempotent
        manager.notify(&mut kernel, 0).unwrap();
        assert_eq!(kernel.semaphore_value(sem_cpu0), Some(2));
    }

    #[test]
    fn test_posted_wakeup_is_consumed_without_parking() {
        let (mut manager, mut kernel, id) = loaded(1);
        assert!(!manager.record_wait(&mut kernel, id, 0).unwrap());
        manager.notify(&mut kernel, 0).unwrap();
        let sem = manager.child(id).unwrap().wakeups[&0].sem;
        assert_eq!(kernel.semaphore_value(sem), Some(1));

        // the next waiter eats the posted count instead of parking
        assert!(manager.record_wait(&mut kernel, id, 0).unwrap());
        assert_eq!(kernel.semaphore_value(sem), Some(0));
        assert_eq!(manager.child(id).unwrap().wakeups[&0].pending, 0);
    }

    #[test]
    fn test_start_children_skips_the_supervisor_module() {
        let mut manager = ChildManager::new(1);
        let mut kernel = SimulatedKernel::new();
        let boot = BootInfo {
            cpu_count: 1,
            modules: vec![
                BootModule {
                    phys_addr: 0x8_0000,
                    image: vec![0; 16], // the supervisor itself, never reloaded
                    cmdline: b"supervisor\0".to_vec(),
                },
                BootModule {
                    phys_addr: MODULE_PHYS,
                    image: two_segment_image(),
                    cmdline: b"hello".to_vec(),
                },
            ],
        };
        let started = manager.start_children(&mut kernel, &boot);
        assert_eq!(started.len(), 1);
        assert_eq!(manager.child(started[0]).unwrap().cmdline, "hello");
    }

    #[test]
    fn test_wrong_portal_and_wrong_operation_are_rejected() {
        let (mut manager, _kernel, id) = loaded(1);
        let mut frame = RegisterFrame::default();
        assert!(matches!(
            manager.handle_startup(PortalId::new(), &mut frame),
            Err(ChildManagerError::UnknownPortal)
        ));
        let register = manager.portal(id, 0, PortalOp::Register).unwrap();
        assert!(matches!(
            manager.handle_startup(register, &mut frame),
            Err(ChildManagerError::WrongOperation)
        ));
    }
}
