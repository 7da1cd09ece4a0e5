// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Per-build, per-derivation log files.
//!
//! Logs live at `<logDir>/<bucket>/<buildID>/<drvDigest>.log`, where
//! `<bucket>` is the first two characters of the build id. Writes are
//! append-only plain UTF-8; reads are bounded and can stream "new bytes
//! since offset" until the associated build result reaches a terminal
//! status.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{IoContext, Result};

/// Largest single read handed back to a client.
const MAX_READ: u64 = 1 << 20;

fn sanitize(component: &str) -> String {
    component
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// The directory holding all log files of one build.
pub fn log_root(log_dir: &Path, build_id: &str) -> PathBuf {
    let id = sanitize(build_id);
    let bucket: String = id.chars().take(2).collect();
    log_dir.join(bucket).join(id)
}

/// The log file for one derivation within one build.
pub fn builder_log_path(log_dir: &Path, build_id: &str, drv_digest: &str) -> PathBuf {
    log_root(log_dir, build_id).join(format!("{}.log", sanitize(drv_digest)))
}

/// A shared append-only log sink for one builder invocation.
pub type LogSink = Arc<Mutex<dyn Write + Send>>;

#[derive(Clone)]
pub struct BuildLogStore {
    dir: PathBuf,
}

impl BuildLogStore {
    pub fn new(dir: PathBuf) -> BuildLogStore {
        BuildLogStore { dir }
    }

    /// Open (creating directories as needed) the append-only log sink for
    /// one builder run.
    pub fn open_sink(&self, build_id: &str, drv_digest: &str) -> Result<LogSink> {
        let path = builder_log_path(&self.dir, build_id, drv_digest);
        let parent = path.parent().expect("log path has a parent");
        std::fs::create_dir_all(parent)
            .io_context(|| format!("failed to create log dir {}", parent.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .io_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Arc::new(Mutex::new(file)))
    }

    /// Append the failure trailer the server writes when a build ends in
    /// failure.
    pub fn append_failure(&self, build_id: &str, drv_digest: &str, message: &str) {
        if let Ok(sink) = self.open_sink(build_id, drv_digest) {
            let mut sink = sink.lock().unwrap();
            let _ = writeln!(sink, "*** Build failed\n{message}");
        }
    }

    /// Read up to `MAX_READ` bytes starting at `range_start`; an optional
    /// `range_end` bounds the read further. Returns the bytes and the
    /// offset of the first unread byte.
    pub fn read(
        &self,
        build_id: &str,
        drv_digest: &str,
        range_start: u64,
        range_end: Option<u64>,
    ) -> Result<(Vec<u8>, u64)> {
        let path = builder_log_path(&self.dir, build_id, drv_digest);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((Vec::new(), range_start));
            }
            Err(e) => {
                return Err(crate::error::ServerError::io(
                    format!("failed to open log file {}", path.display()),
                    e,
                ));
            }
        };
        let len = file
            .metadata()
            .io_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if range_start >= len {
            return Ok((Vec::new(), len.max(range_start)));
        }

        let end = range_end.unwrap_or(len).min(len);
        let take = end.saturating_sub(range_start).min(MAX_READ);
        file.seek(SeekFrom::Start(range_start))
            .io_context(|| format!("failed to seek {}", path.display()))?;
        let mut buf = vec![0u8; take as usize];
        file.read_exact(&mut buf)
            .io_context(|| format!("failed to read {}", path.display()))?;
        Ok((buf, range_start + take))
    }
}
