// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The build user pool: a bounded set of distinct Unix UIDs handed out to
//! concurrent builders.
//!
//! An empty pool means builders run with the daemon's own credentials
//! (`acquire` returns `None` immediately). Releasing a lease wakes a
//! single waiter.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::mutex_map::Cancelled;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserPoolError {
    #[error("duplicate build user id {0}")]
    DuplicateUid(u32),
    #[error("build user id {0} is the daemon's own uid")]
    OwnUid(u32),
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<u32>>,
    notify: Notify,
}

#[derive(Clone)]
pub struct UserPool {
    inner: Arc<PoolInner>,
    empty: bool,
}

impl UserPool {
    /// Construct a pool from a set of UIDs. Duplicates are rejected, as
    /// is the daemon's own UID (a builder must never run as the daemon).
    pub fn new(uids: &[u32]) -> Result<UserPool, UserPoolError> {
        let mut seen = std::collections::BTreeSet::new();
        #[cfg(unix)]
        let own = nix::unistd::geteuid().as_raw();
        #[cfg(not(unix))]
        let own = u32::MAX;
        for &uid in uids {
            if !seen.insert(uid) {
                return Err(UserPoolError::DuplicateUid(uid));
            }
            if uid == own {
                return Err(UserPoolError::OwnUid(uid));
            }
        }
        Ok(UserPool {
            empty: uids.is_empty(),
            inner: Arc::new(PoolInner {
                free: Mutex::new(uids.to_vec()),
                notify: Notify::new(),
            }),
        })
    }

    /// Acquire a build user, waiting for one to free up.
    ///
    /// Returns `None` when the pool is empty (current process credentials
    /// are used).
    pub async fn acquire(&self, ctx: &CancellationToken) -> Result<Option<UserLease>, Cancelled> {
        if self.empty {
            return Ok(None);
        }
        loop {
            if let Some(uid) = self.inner.free.lock().unwrap().pop() {
                return Ok(Some(UserLease {
                    pool: Arc::clone(&self.inner),
                    uid,
                }));
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = ctx.cancelled() => return Err(Cancelled),
            }
        }
    }
}

/// A held build user; returned to the pool on drop.
#[derive(Debug)]
pub struct UserLease {
    pool: Arc<PoolInner>,
    uid: u32,
}

impl UserLease {
    pub fn uid(&self) -> u32 {
        self.uid
    }
}

impl Drop for UserLease {
    fn drop(&mut self) {
        self.pool.free.lock().unwrap().push(self.uid);
        self.pool.notify.notify_one();
    }
}
