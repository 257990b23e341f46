//! # IPC
//!
//! Synchronous call/reply message primitives for the Capstan supervisor.
//!
//! ## Philosophy
//!
//! All communication between the supervisor and its children happens
//! through fixed-capacity message buffers carrying untyped data words and
//! typed capability-transfer items. There are no streams, no callbacks and
//! no hidden queues: one call, one buffer, one reply.

pub mod batch;
pub mod buffer;

pub use batch::plan_transfer;
pub use buffer::{
    IpcError, MessageBuffer, TransferKind, TypedItem, TypedPayload, TYPED_ITEM_WORDS,
    WORD_CAPACITY,
};
