use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::jobs::model::LogEntry;

/// Append-only, order-preserving log accumulator.
/// Re-appending an entry with an identity already present is a no-op.
#[derive(Debug, Default, Clone)]
pub struct LogStore {
    entries: Vec<LogEntry>,
    seen: HashSet<(String, String)>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns only the entries that were not already present.
    pub fn append<I>(&mut self, entries: I) -> Vec<LogEntry>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut added = Vec::new();
        for entry in entries {
            let key = (entry.message.clone(), entry.timestamp.clone());
            if self.seen.insert(key) {
                self.entries.push(entry.clone());
                added.push(entry);
            }
        }
        added
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared handle the UI renders from. Every mutation bumps a revision
/// counter so renderers can wait for changes instead of polling.
#[derive(Clone)]
pub struct LiveLog {
    store: Arc<Mutex<LogStore>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for LiveLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveLog {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            store: Arc::new(Mutex::new(LogStore::new())),
            revision: Arc::new(tx),
        }
    }

    pub fn append<I>(&self, entries: I) -> Vec<LogEntry>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let added = self.lock().append(entries);
        if !added.is_empty() {
            self.revision.send_modify(|r| *r += 1);
        }
        added
    }

    pub fn push(&self, entry: LogEntry) -> bool {
        !self.append([entry]).is_empty()
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().snapshot()
    }

    /// Entries from `from` onwards; lets a renderer print only what is new.
    pub fn since(&self, from: usize) -> Vec<LogEntry> {
        let store = self.lock();
        store.entries.iter().skip(from).cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.revision.send_modify(|r| *r += 1);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, LogStore> {
        // a poisoned store still holds valid entries
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}
