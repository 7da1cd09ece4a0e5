// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Daemon error types.

use std::collections::BTreeSet;

use thiserror::Error;

use zb_store_core::store_path::InvalidPathError;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request: bad path, non-derivation target, invalid JSON.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("object does not exist: {0}")]
    ObjectNotExist(String),

    #[error("object '{0}' mismatches existing data")]
    MismatchesExistingData(String),

    #[error("content address verification failed for '{path}': declared {declared}, computed {computed}")]
    CaVerificationFailed {
        path: String,
        declared: String,
        computed: String,
    },

    #[error("missing input store path '{0}'")]
    MissingInput(String),

    #[error("a builder for system '{system}' cannot run on this host")]
    SystemMismatch { system: String },

    /// User-attributable builder failure (non-zero exit, missing output).
    #[error("builder failed: {0}")]
    BuilderFailure(String),

    #[error("cannot delete: {} object(s) still refer to the target set", .0.len())]
    HasReferrers(BTreeSet<String>),

    /// The database commit succeeded but some real paths could not be
    /// removed; the database state is authoritative.
    #[error("deletion incomplete: {} path(s) left on disk", .0.len())]
    DeletionIncomplete(Vec<String>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("server is draining; no new builds accepted")]
    Draining,

    #[error("build '{0}' does not exist")]
    UnknownBuild(String),

    #[error("database error: {0}")]
    Db(zb_store_db::Error),

    #[error("archive error: {0}")]
    Nar(#[from] zb_nar::NarError),

    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn internal(message: impl Into<String>) -> Self {
        ServerError::Internal(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        ServerError::Io {
            message: message.into(),
            source,
        }
    }

    /// Whether this error counts as a user-level build failure (status
    /// `fail`) rather than an internal error (status `error`).
    pub fn is_builder_failure(&self) -> bool {
        matches!(
            self,
            ServerError::BuilderFailure(_)
                | ServerError::MissingInput(_)
                | ServerError::SystemMismatch { .. }
        )
    }
}

impl From<InvalidPathError> for ServerError {
    fn from(err: InvalidPathError) -> Self {
        ServerError::InvalidParams(err.to_string())
    }
}

impl From<zb_store_db::Error> for ServerError {
    fn from(err: zb_store_db::Error) -> Self {
        match err {
            zb_store_db::Error::ObjectNotExist(path) => ServerError::ObjectNotExist(path),
            zb_store_db::Error::MismatchesExistingData(path) => {
                ServerError::MismatchesExistingData(path)
            }
            zb_store_db::Error::HasReferrers { referrers } => ServerError::HasReferrers(referrers),
            other => ServerError::Db(other),
        }
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServerError::Internal(format!("task join error: {err}"))
    }
}

/// Helper trait for adding context to IO errors
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ServerError::io(f(), e))
    }
}
