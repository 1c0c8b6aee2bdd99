//! Latest rich presence per process id.
//!
//! The proxy loop is the only writer. Readers may live on other threads (the
//! activity tracker polls on its own schedule), so the table sits behind a
//! `RwLock` and every handle is a cheap clone of the same `Arc`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub pid: i32,
    pub state: Option<String>,
    pub details: Option<String>,
    /// Monotonic; compare against `Instant::now()` to judge staleness.
    #[serde(skip)]
    pub updated_at: Instant,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceStore {
    entries: Arc<RwLock<HashMap<i32, PresenceEntry>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was stored for `pid`. Ignored when `pid <= 0`.
    ///
    /// The whole entry is replaced: an update without a state clears the
    /// previous state.
    pub fn put(&self, pid: i32, state: Option<String>, details: Option<String>) {
        if pid <= 0 {
            return;
        }

        let entry = PresenceEntry {
            pid,
            state,
            details,
            updated_at: Instant::now(),
            recorded_at: Utc::now(),
        };
        // Recover from poisoning - each write replaces a whole entry
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(pid, entry);
    }

    pub fn get(&self, pid: i32) -> Option<PresenceEntry> {
        if pid <= 0 {
            return None;
        }
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&pid).cloned()
    }

    /// All entries, ordered by pid.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<PresenceEntry> = entries.values().cloned().collect();
        all.sort_by_key(|entry| entry.pid);
        all
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
