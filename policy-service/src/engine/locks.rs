//! Per-key async mutual exclusion.
//!
//! Entries are created on first use and removed once the last holder or waiter
//! lets go, so the table only holds keys that are currently contended.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Weak<Mutex<()>>>;

#[derive(Default)]
pub struct KeyedLocks {
    table: Arc<LockTable>,
}

/// Held while a key is locked. Dropping it releases the key.
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
    _cleanup: EntryCleanup,
}

/// Drops the table entry once nothing references its mutex. Created before
/// waiting, so a waiter abandoned mid-acquire still cleans up.
struct EntryCleanup {
    key: String,
    table: Arc<LockTable>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_for(tenant_id: &str, identity: &str) -> String {
        format!("{}::{}", tenant_id, identity)
    }

    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let cleanup = EntryCleanup {
            key: key.to_string(),
            table: self.table.clone(),
        };
        let mutex = {
            let mut entry = self
                .table
                .entry(key.to_string())
                .or_insert_with(Weak::new);
            match entry.upgrade() {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(Mutex::new(()));
                    *entry = Arc::downgrade(&fresh);
                    fresh
                }
            }
        };

        let guard = mutex.lock_owned().await;
        KeyedGuard {
            _guard: guard,
            _cleanup: cleanup,
        }
    }

    /// Number of keys with a live lock.
    pub fn active_keys(&self) -> usize {
        self.table.iter().filter(|e| e.value().strong_count() > 0).count()
    }
}

impl Drop for EntryCleanup {
    fn drop(&mut self) {
        self.table
            .remove_if(&self.key, |_, weak| weak.strong_count() == 0);
    }
}
