//! Per-child state.

use crate::region_list::RegionList;
use cap_types::{ChildId, DomainCap, ExecContextCap, PortalId, SchedContextCap, SemaphoreCap};
use std::collections::HashMap;

/// Frames a diagnostic backtrace will walk at most
const MAX_BACKTRACE_FRAMES: usize = 32;

/// Lifecycle of one child.
///
/// Transitions only move forward: a destroyed child is never revived and
/// a faulting child never resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Kernel objects are being created; not yet runnable
    Loading,
    /// Scheduling context exists; the child may run
    Running,
    /// An unresolvable fault was observed; teardown is in progress
    Faulting,
    /// All references dropped; kernel objects released
    Destroyed,
}

/// One execution context of a child, bound to one CPU.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext {
    pub cap: ExecContextCap,
    pub cpu: usize,
    /// Set once the startup protocol ran for this context
    pub started: bool,
}

/// Per-CPU wakeup channel of one child.
#[derive(Debug, Clone, Copy)]
pub struct Wakeup {
    pub sem: SemaphoreCap,
    /// Signals owed but not yet delivered
    pub pending: u32,
}

/// One loaded, isolated task.
///
/// Owned exclusively by the manager's child table; the reference count
/// tracks live execution contexts, and the child is torn down only when
/// it reaches zero.
#[derive(Debug)]
pub struct Child {
    pub id: ChildId,
    pub cmdline: String,
    pub state: ChildState,
    pub domain: DomainCap,
    pub sched: Option<SchedContextCap>,
    pub entry: u64,
    pub contexts: Vec<ExecContext>,
    pub portals: Vec<PortalId>,
    pub regions: RegionList,
    /// Virtual base of the child's stack region
    pub stack_base: u64,
    /// The supervisor-side copy of the stack pages, for fault diagnostics
    pub stack_bytes: Vec<u8>,
    /// Virtual address of the per-task control block
    pub control_block: u64,
    /// Virtual address of the boot-information page
    pub boot_info: u64,
    /// Live execution-context references
    pub refs: usize,
    pub wakeups: HashMap<usize, Wakeup>,
}

impl Child {
    pub fn context_on(&self, cpu: usize) -> Option<&ExecContext> {
        self.contexts.iter().find(|c| c.cpu == cpu)
    }

    pub fn context_on_mut(&mut self, cpu: usize) -> Option<&mut ExecContext> {
        self.contexts.iter_mut().find(|c| c.cpu == cpu)
    }

    fn stack_word(&self, virt: u64) -> Option<u64> {
        let offset = virt.checked_sub(self.stack_base)? as usize;
        let bytes = self.stack_bytes.get(offset..offset + 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }

    /// Best-effort frame-pointer backtrace from the child's staged stack.
    ///
    /// Each frame is a `(saved frame pointer, return address)` pair; the
    /// walk stops at the first frame that leaves the stack, fails to make
    /// progress, or carries a zero return address. A garbled stack yields
    /// a short or empty trace, never an error.
    pub fn backtrace(&self, frame_pointer: u64) -> Vec<u64> {
        let mut frames = Vec::new();
        let mut fp = frame_pointer;
        while frames.len() < MAX_BACKTRACE_FRAMES {
            let Some(next_fp) = self.stack_word(fp) else {
                break;
            };
            let Some(ret) = self.stack_word(fp + 8) else {
                break;
            };
            if ret == 0 {
                break;
            }
            frames.push(ret);
            if next_fp <= fp {
                break;
            }
            fp = next_fp;
        }
        frames
    }
}
