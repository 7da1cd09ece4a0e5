// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Database row types for zb store metadata.
//!
//! This layer is deliberately string-typed: full path strings, textual
//! hashes and content addresses. The daemon converts to and from the core
//! value types at its boundary.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Metadata for one store object, as inserted and queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full store path (e.g. /zb/store/xxx-name)
    pub path: String,
    /// Size of the canonical archive serialization
    pub nar_size: u64,
    /// Textual archive hash ("sha256:<base32>")
    pub nar_hash: String,
    /// Textual content address
    pub ca: String,
    /// Full store paths this object references (may include itself)
    pub references: BTreeSet<String>,
}

/// An [`ObjectInfo`] with its database row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    pub id: i64,
    pub info: ObjectInfo,
}

/// A candidate output path for a realization query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizationCandidate {
    pub path_id: i64,
    pub path: String,
    /// Whether an `objects` row (and therefore the on-disk object) exists.
    pub present: bool,
}

/// One closure row of a recorded realization: a transitively referenced
/// path together with one equivalence class that may have produced it
/// (`None` marks a source path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceClassRow {
    pub reference_path: String,
    pub drv_hash: Option<DrvHashRow>,
    pub output_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrvHashRow {
    pub algo: String,
    pub bits: Vec<u8>,
}

/// A closure row to insert when recording a realization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceClassInsert {
    pub reference_path: String,
    pub drv_hash: Option<DrvHashRow>,
    pub output_name: Option<String>,
}

/// A row from the `builds` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRow {
    pub id: String,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub status: String,
}

/// A row from the `build_results` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResultRow {
    pub build_id: String,
    pub drv_path: String,
    pub status: String,
    /// JSON object mapping output names to store paths, once known.
    pub output_paths: Option<String>,
    pub error: Option<String>,
}

/// Convert Unix timestamp to SystemTime.
pub(crate) fn unix_to_system_time(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-timestamp) as u64)
    }
}

/// Convert SystemTime to Unix timestamp.
pub(crate) fn system_time_to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
