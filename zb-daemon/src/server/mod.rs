// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Server state: the store, the realization engine, active builds, and
//! drain handling.

pub mod handler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zb_store_core::store_path::{StoreDir, StorePath};
use zb_store_db::{OpenMode, StoreDb};

use crate::build::{BuildSettings, BuildStatus, Builder};
use crate::build_log::BuildLogStore;
use crate::build_users::UserPool;
use crate::config::Config;
use crate::error::{IoContext, Result, ServerError};
use crate::mutex_map::MutexMap;
use crate::runner::RunLimits;
use crate::store::Store;

/// How long terminal build recording may run after cancellation.
const RECORD_END_KEEPALIVE: Duration = Duration::from_secs(30);

/// Poll interval while a followed log has no new bytes yet. Readers must
/// tolerate any flush granularity, so this is a latency knob only.
const LOG_FOLLOW_INTERVAL: Duration = Duration::from_millis(100);

struct ActiveBuild {
    cancel: CancellationToken,
}

struct ServerInner {
    store: Store,
    builder: Builder,
    logs: BuildLogStore,
    builds: Mutex<HashMap<String, ActiveBuild>>,
    draining: Mutex<bool>,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Wire up a server from configuration: open (or create) the
    /// database, the store handle, the user pool, and the build engine.
    pub fn new(config: &Config) -> Result<Server> {
        let dir = StoreDir::new(config.store_dir.to_string_lossy().to_string())?;
        let real_dir = config.real_store_dir().to_owned();

        std::fs::create_dir_all(&real_dir)
            .io_context(|| format!("failed to create store dir {}", real_dir.display()))?;
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .io_context(|| format!("failed to create state dir {}", parent.display()))?;
        }
        let db = StoreDb::open(&config.db_path, OpenMode::Create)?;
        let store = Store::new(dir, real_dir, db);

        let users = UserPool::new(&config.build_users)
            .map_err(|e| ServerError::InvalidParams(e.to_string()))?;
        let logs = BuildLogStore::new(config.log_dir.clone());
        let builder = Builder {
            store: store.clone(),
            building: Arc::new(MutexMap::new()),
            users,
            logs: logs.clone(),
            settings: BuildSettings {
                build_dir: config.build_dir.clone(),
                cores: config.effective_cores(),
                sandbox_paths: config.sandbox_paths.clone(),
                allow_keep_failed: config.allow_keep_failed,
                limits: RunLimits::default(),
            },
        };

        Ok(Server {
            inner: Arc::new(ServerInner {
                store,
                builder,
                logs,
                builds: Mutex::new(HashMap::new()),
                draining: Mutex::new(false),
            }),
        })
    }

    /// A server over pre-built parts (used by tests).
    pub fn from_parts(store: Store, builder: Builder, logs: BuildLogStore) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                store,
                builder,
                logs,
                builds: Mutex::new(HashMap::new()),
                draining: Mutex::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn logs(&self) -> &BuildLogStore {
        &self.inner.logs
    }

    pub fn is_draining(&self) -> bool {
        *self.inner.draining.lock().unwrap()
    }

    fn new_build_id() -> Result<String> {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes)
            .map_err(|e| ServerError::internal(format!("random build id: {e}")))?;
        Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Start an asynchronous realize build. Returns the build id; status
    /// is polled via `getBuild`.
    pub async fn start_realize(
        &self,
        drv_paths: Vec<StorePath>,
        keep_failed: bool,
        reuse: bool,
    ) -> Result<String> {
        self.start_build(move |server, build_id, ctx| async move {
            server
                .inner
                .builder
                .realize(&build_id, &drv_paths, keep_failed, reuse, &ctx)
                .await
        })
        .await
    }

    /// Start an asynchronous expand: realize the derivation's inputs and
    /// report the expanded builder, args, and env.
    pub async fn start_expand(
        &self,
        drv_path: StorePath,
        temporary_directory: String,
    ) -> Result<String> {
        self.start_build(move |server, build_id, ctx| async move {
            server
                .inner
                .builder
                .expand(&build_id, &drv_path, &temporary_directory, &ctx)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn start_build<F, Fut>(&self, body: F) -> Result<String>
    where
        F: FnOnce(Server, String, CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_draining() {
            return Err(ServerError::Draining);
        }

        let build_id = Self::new_build_id()?;
        {
            let build_id = build_id.clone();
            self.inner
                .store
                .with_db(move |db| Ok(db.create_build(&build_id, SystemTime::now())?))
                .await?;
        }

        let cancel = CancellationToken::new();
        self.inner.builds.lock().unwrap().insert(
            build_id.clone(),
            ActiveBuild {
                cancel: cancel.clone(),
            },
        );

        let server = self.clone();
        let id = build_id.clone();
        tokio::spawn(async move {
            let result = body(server.clone(), id.clone(), cancel.clone()).await;
            let status = match &result {
                Ok(()) => BuildStatus::Success,
                Err(e) => BuildStatus::for_error(e),
            };
            if let Err(e) = &result {
                info!("build {id} ended {}: {e}", status.as_str());
            } else {
                info!("build {id} ended {}", status.as_str());
            }

            // Terminal recording runs detached from the build's own
            // context, time-bounded, so the database reflects the end
            // state even after cancellation.
            let store = server.inner.store.clone();
            let id2 = id.clone();
            let record = store.with_db(move |db| {
                Ok(db.finish_build(&id2, status.as_str(), SystemTime::now())?)
            });
            if let Err(e) = tokio::time::timeout(RECORD_END_KEEPALIVE, record)
                .await
                .unwrap_or_else(|_| Err(ServerError::internal("terminal recording timed out")))
            {
                warn!("failed to record end of build {id}: {e}");
            }

            server.inner.builds.lock().unwrap().remove(&id);
        });

        Ok(build_id)
    }

    /// Read a range of one builder's log.
    ///
    /// With `follow`, blocks until new bytes appear at `range_start` or
    /// the associated build result reaches a terminal status; the
    /// returned flag is `true` once the log is terminal and fully
    /// drained, telling the reader to stop.
    pub async fn read_log(
        &self,
        ctx: &CancellationToken,
        build_id: &str,
        drv_path: &StorePath,
        range_start: u64,
        range_end: Option<u64>,
        follow: bool,
    ) -> Result<(Vec<u8>, u64, bool)> {
        let digest = drv_path.digest().as_str().to_owned();
        let drv_full = self.inner.store.dir().display_path(drv_path);

        loop {
            // Status first, bytes second: anything appended before the
            // terminal transition is picked up by this same read.
            let terminal = self.result_terminal(build_id, &drv_full).await?;

            let logs = self.inner.logs.clone();
            let id = build_id.to_owned();
            let digest2 = digest.clone();
            let (bytes, next) = tokio::task::spawn_blocking(move || {
                logs.read(&id, &digest2, range_start, range_end)
            })
            .await??;

            let empty = bytes.is_empty();
            if !empty || terminal || !follow {
                return Ok((bytes, next, terminal && empty));
            }

            tokio::select! {
                _ = tokio::time::sleep(LOG_FOLLOW_INTERVAL) => {}
                _ = ctx.cancelled() => return Err(ServerError::Cancelled),
            }
        }
    }

    /// Whether the build result for one derivation is terminal. Before
    /// the per-derivation row exists, the build row itself decides (a
    /// build that failed early never creates rows for later derivations).
    async fn result_terminal(&self, build_id: &str, drv_full: &str) -> Result<bool> {
        let id = build_id.to_owned();
        let drv = drv_full.to_owned();
        let status = self
            .inner
            .store
            .with_db(move |db| {
                if let Some(row) = db.get_build_result(&id, &drv)? {
                    return Ok(Some(row.status));
                }
                Ok(db.get_build(&id)?.map(|build| build.status))
            })
            .await?;
        match status {
            Some(status) => Ok(status != "active"),
            None => Err(ServerError::UnknownBuild(build_id.to_owned())),
        }
    }

    /// Cancel an active build. Completed builds are left untouched.
    pub async fn cancel_build(&self, build_id: &str) -> Result<()> {
        let cancel = {
            let builds = self.inner.builds.lock().unwrap();
            builds.get(build_id).map(|b| b.cancel.clone())
        };
        match cancel {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => {
                // Not active; it must at least exist.
                let id = build_id.to_owned();
                let row = self
                    .inner
                    .store
                    .with_db(move |db| Ok(db.get_build(&id)?))
                    .await?;
                if row.is_none() {
                    return Err(ServerError::UnknownBuild(build_id.to_owned()));
                }
                Ok(())
            }
        }
    }

    /// Enter draining: refuse new builds and cancel all active ones.
    pub fn drain(&self) {
        *self.inner.draining.lock().unwrap() = true;
        let builds = self.inner.builds.lock().unwrap();
        for (id, build) in builds.iter() {
            info!("cancelling build {id} for shutdown");
            build.cancel.cancel();
        }
    }

    /// Number of builds still running.
    pub fn active_builds(&self) -> usize {
        self.inner.builds.lock().unwrap().len()
    }
}
