// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The store service: object existence, metadata, registration, export,
//! and deletion over the metadata database and the real store directory.
//!
//! All filesystem writes (and the existence check, which is a write
//! precondition elsewhere) happen under the per-path `writing` lock, so
//! the row ⇔ file invariant can be observed reliably.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zb_nar::SourceCaOptions;
use zb_store_core::content_address::{ContentAddress, PathRefs, fixed_ca_output_path};
use zb_store_core::store_path::{StoreDir, StorePath};
use zb_store_db::StoreDb;
use zb_utils_hash::{Algorithm, Context, NarHash};

use crate::error::{IoContext, Result, ServerError};
use crate::export;
use crate::freeze;
use crate::mutex_map::MutexMap;

/// Typed metadata for one store object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: StorePath,
    pub nar_size: u64,
    pub nar_hash: NarHash,
    pub ca: ContentAddress,
    pub references: BTreeSet<StorePath>,
}

impl ObjectMeta {
    pub fn to_db(&self, dir: &StoreDir) -> zb_store_db::ObjectInfo {
        zb_store_db::ObjectInfo {
            path: dir.display_path(&self.path),
            nar_size: self.nar_size,
            nar_hash: zb_utils_hash::Hash::from(self.nar_hash).to_string(),
            ca: self.ca.to_string(),
            references: self
                .references
                .iter()
                .map(|r| dir.display_path(r))
                .collect(),
        }
    }

    pub fn from_db(dir: &StoreDir, info: &zb_store_db::ObjectInfo) -> Result<ObjectMeta> {
        let path = dir.parse_object_path(&info.path)?;
        let hash: zb_utils_hash::Hash = info
            .nar_hash
            .parse()
            .map_err(|e| ServerError::internal(format!("bad nar hash in database: {e}")))?;
        let nar_hash: NarHash = hash
            .try_into()
            .map_err(|e| ServerError::internal(format!("bad nar hash in database: {e}")))?;
        let ca: ContentAddress = info
            .ca
            .parse()
            .map_err(|e| ServerError::internal(format!("bad content address in database: {e}")))?;
        let mut references = BTreeSet::new();
        for reference in &info.references {
            references.insert(dir.parse_object_path(reference)?);
        }
        Ok(ObjectMeta {
            path,
            nar_size: info.nar_size,
            nar_hash,
            ca,
            references,
        })
    }

    /// References as path-derivation inputs: self split out.
    pub fn path_refs(&self) -> PathRefs {
        PathRefs {
            self_ref: self.references.contains(&self.path),
            others: self
                .references
                .iter()
                .filter(|r| **r != self.path)
                .cloned()
                .collect(),
        }
    }
}

struct StoreInner {
    dir: StoreDir,
    real_dir: PathBuf,
    db: Arc<Mutex<StoreDb>>,
    writing: MutexMap<StorePath>,
}

/// Handle on the store; cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(dir: StoreDir, real_dir: PathBuf, db: StoreDb) -> Store {
        Store {
            inner: Arc::new(StoreInner {
                dir,
                real_dir,
                db: Arc::new(Mutex::new(db)),
                writing: MutexMap::new(),
            }),
        }
    }

    pub fn dir(&self) -> &StoreDir {
        &self.inner.dir
    }

    pub fn real_dir(&self) -> &Path {
        &self.inner.real_dir
    }

    pub fn db(&self) -> Arc<Mutex<StoreDb>> {
        Arc::clone(&self.inner.db)
    }

    pub fn writing(&self) -> &MutexMap<StorePath> {
        &self.inner.writing
    }

    /// The on-disk location of a store path.
    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.inner.real_dir.join(path.to_string())
    }

    /// Parse an absolute store path string belonging to this store.
    pub fn parse_path(&self, s: &str) -> Result<StorePath> {
        Ok(self.inner.dir.parse_object_path(s)?)
    }

    /// Run a closure against the database on the blocking pool.
    pub async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDb) -> Result<T> + Send + 'static,
    {
        let db = self.db();
        tokio::task::spawn_blocking(move || {
            let mut db = db.blocking_lock();
            f(&mut db)
        })
        .await?
    }

    /// Does the object exist on disk? Takes the `writing` lock so the
    /// answer is consistent with concurrent imports and deletions.
    pub async fn exists(&self, ctx: &CancellationToken, path: &StorePath) -> Result<bool> {
        let _guard = self
            .inner
            .writing
            .lock(ctx, path.clone())
            .await
            .map_err(|_| ServerError::Cancelled)?;
        Ok(std::fs::symlink_metadata(self.real_path(path)).is_ok())
    }

    /// Object metadata, or `None` when not registered.
    pub async fn info(&self, path: &StorePath) -> Result<Option<ObjectMeta>> {
        let full = self.inner.dir.display_path(path);
        let row = self
            .with_db(move |db| Ok(db.object_info(&full)?))
            .await?;
        match row {
            Some(row) => Ok(Some(ObjectMeta::from_db(&self.inner.dir, &row.info)?)),
            None => Ok(None),
        }
    }

    /// Register an object that is already on disk.
    ///
    /// Verifies the declared content address by re-dumping the tree, then
    /// inserts the row (idempotent when an identical row exists).
    pub async fn register(&self, ctx: &CancellationToken, meta: ObjectMeta) -> Result<()> {
        let _guard = self
            .inner
            .writing
            .lock(ctx, meta.path.clone())
            .await
            .map_err(|_| ServerError::Cancelled)?;

        let real = self.real_path(&meta.path);
        if std::fs::symlink_metadata(&real).is_err() {
            return Err(ServerError::ObjectNotExist(
                self.inner.dir.display_path(&meta.path),
            ));
        }

        let store = self.clone();
        let meta2 = meta.clone();
        tokio::task::spawn_blocking(move || store.verify_on_disk(&meta2, &real)).await??;

        let db_info = meta.to_db(&self.inner.dir);
        self.with_db(move |db| match db.insert_object(&db_info) {
            Ok(_) => Ok(()),
            Err(zb_store_db::Error::ObjectExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Verify a declared content address against the on-disk tree.
    fn verify_on_disk(&self, meta: &ObjectMeta, real: &Path) -> Result<()> {
        let mut nar = Vec::new();
        zb_nar::dump(&mut nar, real)?;
        let computed = compute_ca_for(&*nar, &meta.ca, &meta.path)?;
        let declared_path = fixed_ca_output_path(
            &self.inner.dir,
            meta.path.name(),
            &computed,
            &meta.path_refs(),
        )
        .map_err(|e| ServerError::InvalidParams(e.to_string()))?;
        if computed != meta.ca || declared_path != meta.path {
            return Err(ServerError::CaVerificationFailed {
                path: self.inner.dir.display_path(&meta.path),
                declared: meta.ca.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }

    /// Export objects as a stream of archive+trailer records into `w`.
    ///
    /// With `exclude_references`, only trailers for exactly the given
    /// paths are emitted, in the given order. Otherwise the transitive
    /// closure is emitted in topological order: every object appears after
    /// all of its non-self references.
    pub fn export_blocking<W: Write + ?Sized>(
        &self,
        paths: &[StorePath],
        exclude_references: bool,
        w: &mut W,
    ) -> Result<()> {
        let db = self.db();
        let dir = &self.inner.dir;

        let metas: Vec<ObjectMeta> = {
            let db = db.blocking_lock();
            if exclude_references {
                let mut metas = Vec::new();
                for path in paths {
                    let full = dir.display_path(path);
                    let row = db
                        .object_info(&full)?
                        .ok_or(ServerError::ObjectNotExist(full))?;
                    metas.push(ObjectMeta::from_db(dir, &row.info)?);
                }
                metas
            } else {
                let roots: Vec<String> = paths.iter().map(|p| dir.display_path(p)).collect();
                let closure = db.closure(&roots)?;
                let mut metas = Vec::new();
                for row in closure.values() {
                    metas.push(ObjectMeta::from_db(dir, &row.info)?);
                }
                topo_sort(metas)?
            }
        };

        for meta in &metas {
            export::write_record(w, dir, self.real_path(&meta.path).as_path(), meta)?;
        }
        export::write_end(w).io_context(|| "failed to write export sentinel".to_owned())?;
        Ok(())
    }

    /// Delete objects, optionally including everything that refers to
    /// them.
    ///
    /// The doomed set is materialized and ordered in the database; the
    /// `writing` locks for every doomed path are acquired before the
    /// deleting transaction commits; the real paths are removed after
    /// commit. Failures to remove files are reported as
    /// [`ServerError::DeletionIncomplete`] but the database state is
    /// authoritative.
    pub async fn delete(
        &self,
        ctx: &CancellationToken,
        paths: &[StorePath],
        recursive: bool,
    ) -> Result<()> {
        let targets: Vec<String> = paths
            .iter()
            .map(|p| self.inner.dir.display_path(p))
            .collect();

        let doomed = self
            .with_db(move |db| Ok(db.collect_doomed(&targets, recursive)?))
            .await?;

        let mut doomed_paths = Vec::with_capacity(doomed.len());
        for full in &doomed {
            doomed_paths.push(self.inner.dir.parse_object_path(full)?);
        }

        // Take the writing locks (in doomed order) before committing, so
        // nothing imports or inspects these paths mid-deletion.
        let mut guards = Vec::with_capacity(doomed_paths.len());
        for path in &doomed_paths {
            guards.push(
                self.inner
                    .writing
                    .lock(ctx, path.clone())
                    .await
                    .map_err(|_| ServerError::Cancelled)?,
            );
        }

        let doomed_for_db = doomed.clone();
        self.with_db(move |db| Ok(db.delete_doomed(&doomed_for_db)?))
            .await?;

        // Database rows are gone; now remove the real paths.
        let store = self.clone();
        let failed = tokio::task::spawn_blocking(move || {
            let mut failed = Vec::new();
            for path in &doomed_paths {
                let real = store.real_path(path);
                freeze::thaw(&real);
                let result = if real.is_dir() {
                    std::fs::remove_dir_all(&real)
                } else {
                    std::fs::remove_file(&real)
                };
                if let Err(e) = result
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("failed to remove {}: {e}", real.display());
                    failed.push(real.display().to_string());
                }
            }
            failed
        })
        .await?;

        drop(guards);

        if failed.is_empty() {
            debug!("deleted {} object(s)", doomed.len());
            Ok(())
        } else {
            Err(ServerError::DeletionIncomplete(failed))
        }
    }
}

/// Compute the content address of the archive in `nar`, in the same form
/// as `declared`.
pub(crate) fn compute_ca_for<R: std::io::Read>(
    nar: R,
    declared: &ContentAddress,
    path: &StorePath,
) -> Result<ContentAddress> {
    match declared {
        ContentAddress::Source { .. } => {
            let result = zb_nar::source_ca(
                nar,
                SourceCaOptions {
                    self_digest: Some(*path.digest()),
                    raw_observer: None,
                },
            )?;
            Ok(result.ca)
        }
        ContentAddress::Recursive(h) => {
            Ok(ContentAddress::Recursive(stream_hash(nar, h.algorithm())?))
        }
        ContentAddress::Flat(h) => Ok(ContentAddress::Flat(flat_hash(nar, h.algorithm())?)),
        ContentAddress::Text(_) => {
            let hash = flat_hash(nar, Algorithm::SHA256)?;
            Ok(ContentAddress::Text(hash.try_into().unwrap()))
        }
    }
}

/// Hash an entire byte stream.
fn stream_hash<R: std::io::Read>(
    mut r: R,
    algorithm: Algorithm,
) -> Result<zb_utils_hash::Hash> {
    let mut ctx = Context::new(algorithm);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| "failed to read archive stream".to_owned())?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(ctx.finish())
}

/// Hash the contents of a single-file archive.
fn flat_hash<R: std::io::Read>(nar: R, algorithm: Algorithm) -> Result<zb_utils_hash::Hash> {
    struct FlatSink {
        ctx: Option<Context>,
    }
    impl zb_nar::NarSink for FlatSink {
        fn file(
            &mut self,
            _path: &Path,
            _executable: bool,
            _size: u64,
            _offset: u64,
            contents: &mut dyn std::io::Read,
        ) -> std::io::Result<()> {
            let Some(ctx) = self.ctx.as_mut() else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "flat content address over a multi-file archive",
                ));
            };
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = contents.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ctx.update(&buf[..n]);
            }
            Ok(())
        }
        fn directory(&mut self, _path: &Path) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "flat content address over a directory",
            ))
        }
        fn symlink(&mut self, _path: &Path, _target: &[u8], _o: u64) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "flat content address over a symlink",
            ))
        }
    }

    let mut sink = FlatSink {
        ctx: Some(Context::new(algorithm)),
    };
    zb_nar::parse(nar, &mut sink)?;
    Ok(sink.ctx.take().unwrap().finish())
}

/// Order object metadata so every object appears after its non-self
/// references.
fn topo_sort(metas: Vec<ObjectMeta>) -> Result<Vec<ObjectMeta>> {
    let mut remaining: std::collections::BTreeMap<StorePath, ObjectMeta> = metas
        .into_iter()
        .map(|meta| (meta.path.clone(), meta))
        .collect();
    let mut emitted: BTreeSet<StorePath> = BTreeSet::new();
    let mut out = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready: Vec<StorePath> = remaining
            .values()
            .filter(|meta| {
                meta.references
                    .iter()
                    .all(|r| *r == meta.path || emitted.contains(r) || !remaining.contains_key(r))
            })
            .map(|meta| meta.path.clone())
            .collect();
        if ready.is_empty() {
            return Err(ServerError::Db(zb_store_db::Error::MissingReferencedObjects));
        }
        for path in ready {
            let meta = remaining.remove(&path).unwrap();
            emitted.insert(path);
            out.push(meta);
        }
    }
    Ok(out)
}
