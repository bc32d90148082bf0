//! In-process exclusion helpers
//!
//! [`ClaimSet`] keeps two workers of overlapping cycles off the same entry.
//! [`KeyedLocks`] serializes renames that target the same destination path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Set of entry ids currently being advanced by some worker
#[derive(Clone, Default)]
pub struct ClaimSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ClaimSet {
    /// Claim an id; `None` if another worker holds it
    pub fn try_claim(&self, id: &str) -> Option<Claim> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(Claim {
            id: id.to_string(),
            set: self.inner.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_claimed(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}

/// Releases the claim when dropped, even if the worker panics
pub struct Claim {
    id: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

/// One async mutex per key, created on demand
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // drop locks nobody holds or waits on
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
