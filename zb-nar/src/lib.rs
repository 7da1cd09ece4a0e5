// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Canonical archive (NAR) format handling.
//!
//! This crate packs and unpacks the deterministic archive format the store
//! uses to serialize filesystem subtrees for hashing and transport.
//!
//! # Key Features
//!
//! - Streaming pack/unpack over `std::io` (bounded memory usage)
//! - Byte offsets for every file's contents within the outer stream
//! - One-pass source content addressing with self-reference analysis
//!
//! # Design Principles
//!
//! 1. **Streaming**: Never require an entire archive in memory
//! 2. **Canonical**: `dump` is byte-for-byte reproducible; `parse` rejects
//!    non-canonical input (unsorted entries, bad padding)
//! 3. **Format-focused**: Only concerned with archive structure

mod extract;
mod reader;
mod source_ca;
pub mod wire;
mod writer;

pub use extract::extract;
pub use reader::{NarSink, parse};
pub use source_ca::{
    FileRegion, Rewrite, SelfRefAnalysis, SourceCaOptions, SourceCaResult, source_ca,
};
pub use writer::dump;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NarError {
    #[error("archive does not start with the nar magic")]
    BadMagic,
    #[error("unexpected token at offset {offset}: expected {expected}")]
    UnexpectedToken { offset: u64, expected: &'static str },
    #[error("string of length {length} at offset {offset} exceeds limit")]
    StringTooLong { offset: u64, length: u64 },
    #[error("non-zero padding at offset {0}")]
    BadPadding(u64),
    #[error("invalid entry name {0:?}")]
    BadEntryName(String),
    #[error("directory entries not in sorted order: {0:?} after {1:?}")]
    UnsortedEntries(String, String),
    #[error("unsupported file type at {0}")]
    UnsupportedFileType(PathBuf),
    #[error("{operation} {path}: {source}")]
    Fs {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NarError {
    pub(crate) fn fs(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        NarError::Fs {
            operation,
            path: path.into(),
            source,
        }
    }
}
