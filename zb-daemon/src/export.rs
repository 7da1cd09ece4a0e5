// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The object transfer stream format.
//!
//! A stream is a concatenation of records, each a continuation marker `1`,
//! the raw archive bytes (self-delimiting), then a trailer: magic, store
//! path, references, optional deriver, and the content address string (or
//! empty for none). The stream ends with a `0` sentinel. All strings use
//! archive-style length-prefixed framing.
//!
//! The exporter and the import path share this module so the two sides
//! cannot drift.

use std::io::{self, Read, Write};
use std::path::Path;

use zb_nar::wire;
use zb_store_core::content_address::ContentAddress;
use zb_store_core::store_path::StoreDir;

use crate::error::{IoContext, Result, ServerError};
use crate::store::ObjectMeta;

/// "NIXE": starts each trailer.
pub const TRAILER_MAGIC: u64 = 0x4558494e;

/// Largest accepted trailer string (paths, content addresses).
const MAX_TRAILER_STRING: u64 = 8192;

/// Largest accepted reference count in one trailer.
const MAX_REFERENCES: u64 = 1 << 16;

/// The metadata that accompanies one object in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub store_path: String,
    pub references: Vec<String>,
    pub deriver: Option<String>,
    /// `None` is transmitted as an empty string: "compute the source
    /// address on the receiving side".
    pub ca: Option<ContentAddress>,
}

fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> io::Result<()> {
    wire::write_bytes(w, s.as_bytes())
}

pub fn write_trailer<W: Write + ?Sized>(w: &mut W, trailer: &Trailer) -> io::Result<()> {
    wire::write_u64(w, TRAILER_MAGIC)?;
    write_string(w, &trailer.store_path)?;
    wire::write_u64(w, trailer.references.len() as u64)?;
    for reference in &trailer.references {
        write_string(w, reference)?;
    }
    write_string(w, trailer.deriver.as_deref().unwrap_or(""))?;
    let ca = trailer.ca.map(|ca| ca.to_string()).unwrap_or_default();
    write_string(w, &ca)
}

/// Emit one full record: continuation marker, archive bytes, trailer.
pub fn write_record<W: Write + ?Sized>(
    w: &mut W,
    dir: &StoreDir,
    real_path: &Path,
    meta: &ObjectMeta,
) -> Result<()> {
    wire::write_u64(w, 1).io_context(|| "failed to write record marker".to_owned())?;
    zb_nar::dump(w, real_path)?;
    let trailer = Trailer {
        store_path: dir.display_path(&meta.path),
        references: meta.references.iter().map(|r| dir.display_path(r)).collect(),
        deriver: None,
        ca: Some(meta.ca),
    };
    write_trailer(w, &trailer).io_context(|| "failed to write trailer".to_owned())?;
    Ok(())
}

pub fn write_end<W: Write + ?Sized>(w: &mut W) -> io::Result<()> {
    wire::write_u64(w, 0)?;
    w.flush()
}

/// Read the continuation marker: `true` when another record follows.
pub fn read_continue<R: Read>(r: &mut R) -> Result<bool> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .io_context(|| "failed to read record marker".to_owned())?;
    match u64::from_le_bytes(buf) {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(ServerError::InvalidParams(format!(
            "bad record marker {n} in import stream"
        ))),
    }
}

pub fn read_trailer<R: Read>(r: R) -> Result<Trailer> {
    let mut r = wire::CountingReader::new(r);
    let magic = r
        .read_u64()
        .io_context(|| "failed to read trailer magic".to_owned())?;
    if magic != TRAILER_MAGIC {
        return Err(ServerError::InvalidParams(format!(
            "bad trailer magic {magic:#x}"
        )));
    }
    let store_path = read_string(&mut r)?;
    let count = r
        .read_u64()
        .io_context(|| "failed to read reference count".to_owned())?;
    if count > MAX_REFERENCES {
        return Err(ServerError::InvalidParams(format!(
            "trailer declares {count} references"
        )));
    }
    let mut references = Vec::with_capacity(count as usize);
    for _ in 0..count {
        references.push(read_string(&mut r)?);
    }
    let deriver = read_string(&mut r)?;
    let ca_string = read_string(&mut r)?;
    let ca = if ca_string.is_empty() {
        None
    } else {
        Some(
            ca_string
                .parse()
                .map_err(|e| ServerError::InvalidParams(format!("bad content address: {e}")))?,
        )
    };
    Ok(Trailer {
        store_path,
        references,
        deriver: if deriver.is_empty() {
            None
        } else {
            Some(deriver)
        },
        ca,
    })
}

fn read_string<R: Read>(r: &mut wire::CountingReader<R>) -> Result<String> {
    let bytes = r.read_bytes(MAX_TRAILER_STRING)?;
    String::from_utf8(bytes)
        .map_err(|e| ServerError::InvalidParams(format!("invalid UTF-8 in trailer: {e}")))
}
