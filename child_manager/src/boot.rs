//! Boot-module ingestion.
//!
//! Boot discovery (an external collaborator) hands the supervisor a list
//! of module images with raw command-line bytes. The first module is the
//! supervisor itself; the rest become children.

use serde::{Deserialize, Serialize};

/// Virtual address at which every child sees the boot-information page
pub const BOOT_INFO_ADDR: u64 = 0xBFFF_F000;

/// One module discovered at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootModule {
    /// Physical address the module image was found at
    pub phys_addr: u64,
    /// The module's raw image bytes
    pub image: Vec<u8>,
    /// Raw command-line bytes, possibly without a NUL terminator
    pub cmdline: Vec<u8>,
}

/// Boot-time facts the supervisor starts from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootInfo {
    /// Number of CPUs the platform reports
    pub cpu_count: usize,
    /// Discovered modules; index 0 is the supervisor itself
    pub modules: Vec<BootModule>,
}

/// Extracts a command line from its mapped span.
///
/// The string ends at the first NUL; a span with no NUL is terminated at
/// the span end, so an unterminated source can never over-read.
pub fn terminate_cmdline(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
