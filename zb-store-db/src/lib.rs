// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! SQLite database interface for zb store metadata.
//!
//! The database is the authority for which store objects exist: an object
//! is in the store exactly when it has an `objects` row, and the daemon
//! keeps the filesystem in lockstep. Realizations and builds are recorded
//! alongside.

mod connection;
mod error;
mod query;
mod schema;
mod types;
mod write;

pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use schema::SCHEMA_VERSION;
pub use types::{
    BuildResultRow, BuildRow, DrvHashRow, ObjectInfo, ObjectRow, RealizationCandidate,
    ReferenceClassInsert, ReferenceClassRow,
};
