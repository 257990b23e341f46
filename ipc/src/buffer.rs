//! Fixed-capacity IPC message buffer.
//!
//! A buffer holds untyped data words (scalars, short strings) and typed
//! items (capability transfer instructions). Typed and untyped content
//! share one fixed word budget: exceeding it is a caller bug, reported as
//! [`IpcError::BufferFull`], never recovered from by growing the buffer.
//! A caller that needs more must split across multiple calls.

use cap_types::{CapRange, ObjectRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Total word capacity of one message buffer
pub const WORD_CAPACITY: usize = 256;

/// Words consumed by one typed item
pub const TYPED_ITEM_WORDS: usize = 2;

/// Errors for message buffer operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// Typed + untyped content would exceed the fixed word capacity
    #[error("message buffer capacity exceeded")]
    BufferFull,
    /// A read ran past the words actually sent
    #[error("message payload truncated")]
    Truncated,
    /// A string payload was not valid UTF-8
    #[error("malformed string payload")]
    MalformedString,
    /// A typed item of the wrong shape was sent for this operation
    #[error("unexpected typed item")]
    UnexpectedTypedItem,
}

/// How a typed item moves authority to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Grant the capability into the receiver's space
    Delegate,
    /// Translate the capability into the receiver's naming, no new grant
    Translate,
}

/// What a typed item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedPayload {
    /// A selector range (memory frames, I/O ports, object selectors)
    Range(CapRange),
    /// A single concrete kernel object
    Object(ObjectRef),
}

/// One capability transfer instruction inside a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedItem {
    pub transfer: TransferKind,
    pub payload: TypedPayload,
}

/// Per-call scratch buffer for one synchronous call or reply.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    capacity: usize,
    words: Vec<u64>,
    typed: Vec<TypedItem>,
    word_pos: usize,
    typed_pos: usize,
}

impl MessageBuffer {
    /// Creates a buffer with the standard word capacity
    pub fn new() -> Self {
        Self::with_capacity(WORD_CAPACITY)
    }

    /// Creates a buffer with an explicit word capacity (tests)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            words: Vec::new(),
            typed: Vec::new(),
            word_pos: 0,
            typed_pos: 0,
        }
    }

    /// Discards all content and read positions, keeping the capacity
    pub fn clear(&mut self) {
        self.words.clear();
        self.typed.clear();
        self.word_pos = 0;
        self.typed_pos = 0;
    }

    fn used_words(&self) -> usize {
        self.words.len() + TYPED_ITEM_WORDS * self.typed.len()
    }

    /// Words still available in this buffer
    pub fn free_words(&self) -> usize {
        self.capacity - self.used_words()
    }

    /// Typed items still available in this buffer
    pub fn free_typed_items(&self) -> usize {
        self.free_words() / TYPED_ITEM_WORDS
    }

    /// Appends one untyped data word
    pub fn push_word(&mut self, word: u64) -> Result<(), IpcError> {
        if self.free_words() < 1 {
            return Err(IpcError::BufferFull);
        }
        self.words.push(word);
        Ok(())
    }

    /// Appends a short string as a length word plus packed byte words
    pub fn push_str(&mut self, s: &str) -> Result<(), IpcError> {
        let bytes = s.as_bytes();
        let needed = 1 + (bytes.len() + 7) / 8;
        if self.free_words() < needed {
            return Err(IpcError::BufferFull);
        }
        self.words.push(bytes.len() as u64);
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.words.push(u64::from_le_bytes(word));
        }
        Ok(())
    }

    fn push_typed(&mut self, item: TypedItem) -> Result<(), IpcError> {
        if self.free_words() < TYPED_ITEM_WORDS {
            return Err(IpcError::BufferFull);
        }
        self.typed.push(item);
        Ok(())
    }

    /// Appends a delegation of a selector range
    pub fn delegate_range(&mut self, range: CapRange) -> Result<(), IpcError> {
        self.push_typed(TypedItem {
            transfer: TransferKind::Delegate,
            payload: TypedPayload::Range(range),
        })
    }

    /// Appends a delegation of one concrete kernel object
    pub fn delegate_object(&mut self, object: ObjectRef) -> Result<(), IpcError> {
        self.push_typed(TypedItem {
            transfer: TransferKind::Delegate,
            payload: TypedPayload::Object(object),
        })
    }

    /// Appends a translation of one concrete kernel object
    pub fn translate_object(&mut self, object: ObjectRef) -> Result<(), IpcError> {
        self.push_typed(TypedItem {
            transfer: TransferKind::Translate,
            payload: TypedPayload::Object(object),
        })
    }

    /// Reads the next untyped word; [`IpcError::Truncated`] past the end
    pub fn take_word(&mut self) -> Result<u64, IpcError> {
        let word = self.words.get(self.word_pos).copied().ok_or(IpcError::Truncated)?;
        self.word_pos += 1;
        Ok(word)
    }

    /// Reads a string written by [`MessageBuffer::push_str`].
    ///
    /// The length word comes from the caller; a length exceeding the
    /// bytes actually present fails with [`IpcError::Truncated`] before
    /// any read.
    pub fn take_str(&mut self) -> Result<String, IpcError> {
        let len = self.take_word()? as usize;
        if len > (self.words.len() - self.word_pos) * 8 {
            return Err(IpcError::Truncated);
        }
        let word_count = (len + 7) / 8;
        let mut bytes = Vec::with_capacity(word_count * 8);
        for _ in 0..word_count {
            bytes.extend_from_slice(&self.take_word()?.to_le_bytes());
        }
        bytes.truncate(len);
        String::from_utf8(bytes).map_err(|_| IpcError::MalformedString)
    }

    /// Reads the next typed item
    pub fn take_typed(&mut self) -> Result<TypedItem, IpcError> {
        let item = self.typed.get(self.typed_pos).copied().ok_or(IpcError::Truncated)?;
        self.typed_pos += 1;
        Ok(item)
    }

    /// Untyped words in send order
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Typed items in send order
    pub fn typed_items(&self) -> &[TypedItem] {
        &self.typed
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
