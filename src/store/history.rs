use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry<S> {
    pub timestamp: DateTime<Utc>,
    pub status: S,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordered, append-only log of status changes.
///
/// The only mutation is [`StatusHistory::append`]; entries can be read but
/// never edited, removed, or reordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHistory<S> {
    entries: Vec<StatusEntry<S>>,
}

impl<S> Default for StatusHistory<S> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<S: Copy + PartialEq> StatusHistory<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_with(status: S, message: Option<String>) -> Self {
        let mut history = Self::new();
        history.append(status, message);
        history
    }

    pub fn append(&mut self, status: S, message: Option<String>) {
        self.append_at(Utc::now(), status, message);
    }

    /// Timestamps never go backwards: an entry older than the current tail is
    /// clamped to the tail's timestamp so the log stays ordered.
    pub fn append_at(&mut self, timestamp: DateTime<Utc>, status: S, message: Option<String>) {
        let timestamp = match self.entries.last() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };
        self.entries.push(StatusEntry {
            timestamp,
            status,
            message,
        });
    }

    pub fn entries(&self) -> &[StatusEntry<S>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&StatusEntry<S>> {
        self.entries.last()
    }

    /// Most recent entry with the given status.
    pub fn latest(&self, status: S) -> Option<&StatusEntry<S>> {
        self.entries.iter().rev().find(|e| e.status == status)
    }

    pub fn count(&self, status: S) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}
