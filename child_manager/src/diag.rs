//! Structured supervisor diagnostics.
//!
//! The supervisor never prints; it records structured entries that a
//! console service (out of scope here) can render. Tests assert on the
//! recorded entries directly.

use cap_types::ChildId;

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Child the entry is about (if any)
    pub source: Option<ChildId>,
    /// Log message
    pub message: String,
    /// Structured fields
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Creates a new log entry
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            source: None,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Sets the child the entry is about
    pub fn with_source(mut self, source: ChildId) -> Self {
        self.source = Some(source);
        self
    }

    /// Adds a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// In-memory sink for supervisor diagnostics.
#[derive(Debug, Default)]
pub struct SupervisorLog {
    entries: Vec<LogEntry>,
}

impl SupervisorLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_entry_builder() {
        let child = ChildId::new();
        let entry = LogEntry::new(LogLevel::Error, "unresolvable fault")
            .with_source(child)
            .with_field("address", "0xdead0000");
        assert_eq!(entry.source, Some(child));
        assert_eq!(entry.fields.len(), 1);
    }

    #[test]
    fn test_sink_records_in_order() {
        let mut log = SupervisorLog::new();
        log.record(LogEntry::new(LogLevel::Info, "first"));
        log.record(LogEntry::new(LogLevel::Warn, "second"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].message, "second");
    }
}
