// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Streaming ingest of store objects.
//!
//! A [`Receiver`] is a per-connection sink: archive bytes are appended to
//! a spooled temporary buffer while a running hash and byte counter are
//! maintained; each trailer triggers verification and atomic
//! registration. A failed verify, extract, or insert leaves no trace in
//! the store or database, and the receiver stays usable for subsequent
//! objects.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tempfile::SpooledTempFile;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zb_store_core::content_address::{ContentAddress, PathRefs, fixed_ca_output_path};
use zb_store_core::store_path::{InvalidPathError, StorePath};
use zb_utils_hash::{Algorithm, Context, NarHash, Sha256};

use crate::error::{IoContext, Result, ServerError};
use crate::export::{self, Trailer};
use crate::freeze;
use crate::store::{ObjectMeta, Store, compute_ca_for};

/// Archive bytes up to this size stay in memory before spilling to disk.
const SPOOL_THRESHOLD: usize = 1 << 20;

pub struct Receiver {
    store: Store,
    buffer: SpooledTempFile,
    hasher: Context,
    size: u64,
}

impl Write for Receiver {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.buffer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer.flush()
    }
}

impl Receiver {
    pub fn new(store: Store) -> Receiver {
        Receiver {
            store,
            buffer: SpooledTempFile::new(SPOOL_THRESHOLD),
            hasher: Context::new(Algorithm::SHA256),
            size: 0,
        }
    }

    /// Process a trailer against the buffered archive bytes, then reset
    /// the buffer and hasher for the next object.
    ///
    /// Objects addressed to a different store directory are skipped
    /// silently (not for us).
    pub async fn commit(&mut self, ctx: &CancellationToken, trailer: &Trailer) -> Result<()> {
        // Always start the next object with a fresh buffer, whatever
        // happens below.
        let mut buffer = std::mem::replace(&mut self.buffer, SpooledTempFile::new(SPOOL_THRESHOLD));
        let hasher = std::mem::replace(&mut self.hasher, Context::new(Algorithm::SHA256));
        let size = std::mem::take(&mut self.size);

        let path = match self.store.dir().parse_object_path(&trailer.store_path) {
            Ok(path) => path,
            Err(InvalidPathError::NotInStore { path, .. }) => {
                debug!("skipping object for foreign store: {path}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut references = PathRefs::none();
        for reference in &trailer.references {
            let parsed = self.store.dir().parse_object_path(reference)?;
            if parsed == path {
                references.self_ref = true;
            } else {
                references.others.insert(parsed);
            }
        }

        // Verify the content address against the buffered bytes.
        let store = self.store.clone();
        let declared = trailer.ca;
        let path2 = path.clone();
        let refs2 = references.clone();
        let (mut buffer, ca) = tokio::task::spawn_blocking(move || -> Result<_> {
            buffer
                .seek(SeekFrom::Start(0))
                .io_context(|| "failed to rewind import buffer".to_owned())?;
            let ca = verify_buffer(&store, &mut buffer, size, &path2, &refs2, declared)?;
            Ok((buffer, ca))
        })
        .await??;

        let _guard = self
            .store
            .writing()
            .lock(ctx, path.clone())
            .await
            .map_err(|_| ServerError::Cancelled)?;

        let real = self.store.real_path(&path);
        if std::fs::symlink_metadata(&real).is_ok() {
            debug!("object {path} already present, skipping extraction");
            return Ok(());
        }

        // Extract; a failure must not leave a partial tree behind.
        let real2 = real.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            buffer
                .seek(SeekFrom::Start(0))
                .io_context(|| "failed to rewind import buffer".to_owned())?;
            if let Err(e) = zb_nar::extract(&mut buffer, &real2) {
                freeze::thaw(&real2);
                let _ = std::fs::remove_dir_all(&real2);
                let _ = std::fs::remove_file(&real2);
                return Err(e.into());
            }
            Ok(())
        })
        .await??;

        let nar_hash: Sha256 = hasher
            .finish()
            .try_into()
            .expect("receiver hasher is sha256");
        let meta = ObjectMeta {
            path: path.clone(),
            nar_size: size,
            nar_hash: NarHash::from(nar_hash),
            ca,
            references: {
                let mut set = references.others.clone();
                if references.self_ref {
                    set.insert(path.clone());
                }
                set
            },
        };

        // Register; on failure remove the freshly extracted tree so no
        // unregistered object lingers on disk.
        let db_info = meta.to_db(self.store.dir());
        let insert = self
            .store
            .with_db(move |db| match db.insert_object(&db_info) {
                Ok(_) => Ok(()),
                Err(zb_store_db::Error::ObjectExists(_)) => Ok(()),
                Err(e) => Err(e.into()),
            })
            .await;
        if let Err(e) = insert {
            let real2 = real.clone();
            tokio::task::spawn_blocking(move || {
                freeze::thaw(&real2);
                let _ = std::fs::remove_dir_all(&real2);
                let _ = std::fs::remove_file(&real2);
            })
            .await?;
            return Err(e);
        }

        tokio::task::spawn_blocking(move || freeze::freeze(&real)).await?;
        debug!("imported {path} ({size} bytes)");
        Ok(())
    }
}

/// Verify the declared content address (or compute the source address for
/// a zero one) and check the path derivation.
fn verify_buffer(
    store: &Store,
    buffer: &mut (impl Read + Seek),
    _size: u64,
    path: &StorePath,
    references: &PathRefs,
    declared: Option<ContentAddress>,
) -> Result<ContentAddress> {
    let computed = match declared {
        None => compute_ca_for(
            buffer,
            &ContentAddress::Source {
                hash: Sha256::digest(""),
                self_ref: false,
            },
            path,
        )?,
        Some(declared_ca) => {
            let computed = compute_ca_for(buffer, &declared_ca, path)?;
            if computed != declared_ca {
                return Err(ServerError::CaVerificationFailed {
                    path: store.dir().display_path(path),
                    declared: declared_ca.to_string(),
                    computed: computed.to_string(),
                });
            }
            computed
        }
    };

    let expected = fixed_ca_output_path(store.dir(), path.name(), &computed, references)
        .map_err(|e| ServerError::InvalidParams(e.to_string()))?;
    if expected != *path {
        return Err(ServerError::CaVerificationFailed {
            path: store.dir().display_path(path),
            declared: declared
                .map(|ca| ca.to_string())
                .unwrap_or_else(|| "(source)".to_owned()),
            computed: format!("{computed} (path {})", store.dir().display_path(&expected)),
        });
    }
    Ok(computed)
}

/// Drive a whole import stream: records are read, teed into a
/// [`Receiver`], and committed one by one. Returns the number of objects
/// accepted.
pub async fn import<R>(store: Store, mut reader: R, ctx: &CancellationToken) -> Result<usize>
where
    R: Read + Send + 'static,
{
    let mut receiver = Receiver::new(store);
    let mut imported = 0usize;

    loop {
        let (next_receiver, next_reader, trailer) =
            tokio::task::spawn_blocking(move || -> Result<_> {
                if !export::read_continue(&mut reader)? {
                    return Ok((receiver, reader, None));
                }
                {
                    let mut tee = TeeReader {
                        inner: &mut reader,
                        sink: &mut receiver,
                    };
                    zb_nar::parse(&mut tee, &mut NullSink)?;
                }
                let trailer = export::read_trailer(&mut reader)?;
                Ok((receiver, reader, Some(trailer)))
            })
            .await??;
        receiver = next_receiver;
        reader = next_reader;

        match trailer {
            None => return Ok(imported),
            Some(trailer) => {
                receiver.commit(ctx, &trailer).await?;
                imported += 1;
            }
        }
    }
}

/// Reader that copies everything it reads into the receiver buffer.
struct TeeReader<'a, R> {
    inner: &'a mut R,
    sink: &'a mut Receiver,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.sink.write_all(&buf[..n])?;
        Ok(n)
    }
}

/// Sink that discards parsed nodes; used only to find the archive's end.
struct NullSink;

impl zb_nar::NarSink for NullSink {
    fn file(
        &mut self,
        _path: &std::path::Path,
        _executable: bool,
        _size: u64,
        _offset: u64,
        _contents: &mut dyn Read,
    ) -> io::Result<()> {
        Ok(())
    }
    fn directory(&mut self, _path: &std::path::Path) -> io::Result<()> {
        Ok(())
    }
    fn symlink(&mut self, _path: &std::path::Path, _target: &[u8], _o: u64) -> io::Result<()> {
        Ok(())
    }
}
