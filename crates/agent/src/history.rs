//! Bounded, in-process record of recent validation results.
//!
//! The generator reads the newest entries as examples of what worked and
//! what didn't. Entries live only as long as the owning orchestrator.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::ValidationOutcome;

#[derive(Debug, Clone)]
pub struct ValidationHistoryEntry {
    pub request: String,
    pub statement: String,
    /// The judgment, without its result rows.
    pub outcome: ValidationOutcome,
    pub timestamp: DateTime<Utc>,
}

impl ValidationHistoryEntry {
    pub fn new(request: impl Into<String>, statement: impl Into<String>, outcome: &ValidationOutcome) -> Self {
        Self {
            request: request.into(),
            statement: statement.into(),
            outcome: ValidationOutcome {
                rows: Vec::new(),
                ..outcome.clone()
            },
            timestamp: Utc::now(),
        }
    }
}

/// FIFO ring buffer; the oldest entry is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct ValidationHistory {
    capacity: usize,
    entries: Mutex<VecDeque<ValidationHistoryEntry>>,
}

impl ValidationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, entry: ValidationHistoryEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ValidationHistoryEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Default for ValidationHistory {
    fn default() -> Self {
        Self::new(50)
    }
}
