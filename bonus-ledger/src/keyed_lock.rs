//! Keyed mutual exclusion
//!
//! One exclusive critical section per string key (order number or user id).
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ DashMap<String, Arc<Mutex<()>>>              │  shard locks: registry shape only
//! └──────────────┬───────────────────────────────┘
//!                │ clone Arc, release shard
//!                ▼
//! ┌──────────────────────────────────────────────┐
//! │ Arc<Mutex<()>>::lock_owned().await           │  key holder exclusivity
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Slots are created on first use and never removed, so the registry grows
//! with the number of distinct keys ever touched.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry handing out exclusive ownership per key
#[derive(Debug)]
pub struct KeyedLock {
    /// Registry name, used in log fields
    name: &'static str,

    /// key -> exclusion slot
    slots: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive ownership of one key; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// Key held by this guard
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLock {
    /// Create an empty registry
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: DashMap::new(),
        }
    }

    /// Wait until the caller exclusively owns `key`
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let slot = self.slot(key);
        let guard = slot.lock_owned().await;

        tracing::trace!(registry = self.name, key, "Key acquired");

        KeyGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Take `key` only if nobody holds it right now
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let slot = self.slot(key);
        slot.try_lock_owned().ok().map(|guard| KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys ever registered
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// No key registered yet
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // The shard lock is released before the caller awaits the slot.
    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.slots.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}
