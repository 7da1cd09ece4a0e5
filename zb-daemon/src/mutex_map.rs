// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Keyed asynchronous mutexes.
//!
//! A [`MutexMap`] hands out an exclusive lock per key. Two distinct keys
//! never block each other, granting is not FIFO (any waiter may win when
//! the holder releases), and keys that are neither held nor waited on
//! consume no memory.
//!
//! The daemon runs two instances: `writing` keyed by store path (held
//! whenever the on-disk path may mutate, or must be observed as a write
//! precondition) and `building` keyed by derivation path (held across the
//! whole build-or-reuse decision).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Lock acquisition was abandoned because the context was cancelled.
#[derive(Debug, PartialEq, Eq)]
pub struct Cancelled;

type Entries<K> = Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>;

pub struct MutexMap<K: Eq + Hash + Clone> {
    entries: Arc<Entries<K>>,
}

impl<K: Eq + Hash + Clone> Default for MutexMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> MutexMap<K> {
    pub fn new() -> Self {
        MutexMap {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, waiting until it is free or `ctx` is
    /// cancelled. The returned guard releases exactly once, on drop.
    pub async fn lock(&self, ctx: &CancellationToken, key: K) -> Result<KeyGuard<K>, Cancelled> {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        tokio::select! {
            guard = entry.clone().lock_owned() => Ok(KeyGuard {
                entries: Arc::clone(&self.entries),
                key,
                guard: Some(guard),
            }),
            _ = ctx.cancelled() => {
                drop(entry);
                prune(&self.entries, &key);
                Err(Cancelled)
            }
        }
    }

    /// Number of keys currently tracked (held or waited on). Test hook for
    /// the no-memory-per-idle-key property.
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Remove the map entry when nothing else holds or awaits it.
fn prune<K: Eq + Hash>(entries: &Arc<Entries<K>>, key: &K) {
    let mut entries = entries.lock().unwrap();
    if let Some(entry) = entries.get(key)
        && Arc::strong_count(entry) == 1
    {
        entries.remove(key);
    }
}

/// Exclusive hold on one key of a [`MutexMap`].
#[derive(Debug)]
pub struct KeyGuard<K: Eq + Hash + Clone> {
    entries: Arc<Entries<K>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release the lock before deciding whether the entry is garbage.
        self.guard.take();
        prune(&self.entries, &self.key);
    }
}
