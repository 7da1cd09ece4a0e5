// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Error types for store database operations.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for store database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store database operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to open database with context
    #[error("Failed to open database at '{path}': {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Database file not found
    #[error("Database not found at: {0}")]
    DatabaseNotFound(PathBuf),

    /// Schema version mismatch
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: i32, found: i32 },

    /// An object row already exists for this path with identical metadata.
    /// Callers usually treat this as idempotent success.
    #[error("object already registered: {0}")]
    ObjectExists(String),

    /// An object row already exists for this path with different metadata.
    #[error("object '{0}' mismatches existing data")]
    MismatchesExistingData(String),

    /// A referenced object is missing from the database.
    #[error("missing referenced object: {0}")]
    MissingObject(String),

    /// Object lookup for a path that has no row.
    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    /// Non-recursive delete blocked by reverse dependencies.
    #[error("cannot delete: {} object(s) still refer to the target set", referrers.len())]
    HasReferrers { referrers: BTreeSet<String> },

    /// The doomed set cannot be ordered by its reference edges.
    #[error("missing referenced objects while ordering deletion")]
    MissingReferencedObjects,
}
