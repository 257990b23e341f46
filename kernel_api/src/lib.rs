//! # Kernel API
//!
//! The interface between the Capstan supervisor and the underlying
//! capability kernel.
//!
//! ## Philosophy
//!
//! The kernel is an external collaborator, consumed, never reimplemented.
//! Every primitive here is atomic and all-or-nothing from the supervisor's
//! point of view. Multiple implementations are possible:
//! - a simulated kernel (for testing, see the `sim_kernel` crate)
//! - a real kernel (syscall bindings)

pub mod error;
pub mod kernel;

pub use error::KernelError;
pub use kernel::{KernelInterface, Qpd};
