// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Database connection management.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::{BUILD_SCHEMA_SQL, REALIZATION_SCHEMA_SQL, SCHEMA_SQL, SCHEMA_VERSION};

/// Database open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access
    ReadOnly,
    /// Read-write access
    ReadWrite,
    /// Create new database if it doesn't exist
    Create,
}

/// SQLite database connection for zb store metadata.
///
/// One connection is the single shared writer of the database; callers
/// serialize logical units behind it.
pub struct StoreDb {
    pub(crate) conn: Connection,
}

impl StoreDb {
    /// Open or create a database at a custom path.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let flags = match mode {
            OpenMode::ReadOnly => {
                if !path.exists() {
                    return Err(Error::DatabaseNotFound(path.to_owned()));
                }
                OpenFlags::SQLITE_OPEN_READ_ONLY
            }
            OpenMode::ReadWrite => {
                if !path.exists() {
                    return Err(Error::DatabaseNotFound(path.to_owned()));
                }
                OpenFlags::SQLITE_OPEN_READ_WRITE
            }
            OpenMode::Create => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };

        let conn = Connection::open_with_flags(path, flags).map_err(|e| Error::DatabaseOpen {
            path: path.to_owned(),
            source: e,
        })?;
        let db = Self { conn };

        if mode == OpenMode::Create {
            db.configure_pragmas()?;
            db.create_schema()?;
        } else {
            db.check_schema_version()?;
        }

        debug!("Opened database at {} ({:?})", path.display(), mode);
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// The database is initialized with the full schema.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure_pragmas()?;
        db.create_schema()?;
        debug!("Created in-memory database");
        Ok(db)
    }

    /// Configure SQLite pragmas: WAL journaling, enforced foreign keys.
    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    /// Create the database schema.
    pub fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.conn.execute_batch(REALIZATION_SCHEMA_SQL)?;
        self.conn.execute_batch(BUILD_SCHEMA_SQL)?;
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!("Created database schema");
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        let found: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if found != SCHEMA_VERSION {
            return Err(Error::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }
        Ok(())
    }

    /// Get raw connection (for advanced usage).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Check if the database has the expected schema tables.
    pub fn has_schema(&self) -> Result<bool> {
        let count: i32 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='objects'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
