use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

use crate::phase::Phase;

pub const DEFAULT_CAPACITY: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub level: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<String>,
}

/// Bounded in-memory diagnostics for operators; the oldest entry is evicted first.
#[derive(Debug)]
pub struct DebugLogSink {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl DebugLogSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, level: Severity, message: impl Into<String>) {
        self.record(level, message, None, None);
    }

    pub fn record(
        &self,
        level: Severity,
        message: impl Into<String>,
        phase: Option<Phase>,
        cycle: Option<&str>,
    ) {
        let entry = LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            level,
            message: message.into(),
            phase,
            cycle: cycle.map(str::to_string),
        };
        let mut guard = self.entries.lock();
        while guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
    }

    /// Oldest first.
    pub fn export_all(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.export_all())
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.message.contains(needle))
            .count()
    }
}

impl Default for DebugLogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
