// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Source content addressing with self-reference analysis.
//!
//! [`source_ca`] makes a single streaming pass over an archive and
//! produces:
//!
//! - the `source` content address: SHA-256 over the stream with every
//!   occurrence of the object's own path digest (in file contents and
//!   symlink targets) masked out with 32 ASCII `0` bytes,
//! - the raw archive hash and size (the raw hash is only meaningful when
//!   no self-references were found),
//! - a [`SelfRefAnalysis`] recording every file content region and every
//!   digest occurrence, so the final digest can later be written in place
//!   without re-reading the whole archive.
//!
//! The same masking rule is applied at verification time, so import-side
//! recomputation and build-side post-processing agree on the address.

use std::io::Read;
use std::path::{Path, PathBuf};

use zb_store_core::content_address::ContentAddress;
use zb_store_core::store_path::{DIGEST_LEN, StorePathDigest};
use zb_utils_hash::{Algorithm, Context, NarHash, Sha256};

use crate::NarError;
use crate::reader::name_to_os;
use crate::wire::{self, CountingReader};

const MASK: [u8; DIGEST_LEN] = [b'0'; DIGEST_LEN];

/// A regular file's content region within the archive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegion {
    pub path: PathBuf,
    pub content_offset: u64,
    pub size: u64,
}

/// One occurrence of the object's own digest inside a file.
///
/// `offset` is relative to the start of the file's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub path: PathBuf,
    pub offset: u64,
}

/// Everything needed to rewrite self-references with the final digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfRefAnalysis {
    pub files: Vec<FileRegion>,
    pub rewrites: Vec<Rewrite>,
    /// Symlinks whose target embeds the digest; they are re-created with a
    /// rewritten target rather than patched in place.
    pub symlinks: Vec<PathBuf>,
}

impl SelfRefAnalysis {
    pub fn has_self_refs(&self) -> bool {
        !self.rewrites.is_empty() || !self.symlinks.is_empty()
    }
}

/// Options for [`source_ca`].
#[derive(Default)]
pub struct SourceCaOptions<'a> {
    /// When set, occurrences of this digest are masked and recorded.
    pub self_digest: Option<StorePathDigest>,
    /// Sees every raw (unmasked) byte of the stream, in order. Used to
    /// fan out reference scanning over the same single read.
    pub raw_observer: Option<&'a mut dyn FnMut(&[u8])>,
}

pub struct SourceCaResult {
    pub ca: ContentAddress,
    pub analysis: SelfRefAnalysis,
    pub nar_size: u64,
    pub nar_hash: NarHash,
}

/// Compute the source content address of the archive in `r` in one pass.
pub fn source_ca<R: Read>(r: R, opts: SourceCaOptions<'_>) -> Result<SourceCaResult, NarError> {
    let mut pass = Pass {
        r: CountingReader::new(r),
        raw: Context::new(Algorithm::SHA256),
        masked: Context::new(Algorithm::SHA256),
        observer: opts.raw_observer,
        pattern: opts.self_digest.map(|d| *d.as_bytes()),
        analysis: SelfRefAnalysis::default(),
    };

    let magic = pass.read_bytes_plain(wire::MAX_STRING_LEN)?;
    if magic != wire::MAGIC {
        return Err(NarError::BadMagic);
    }
    pass.node(&PathBuf::new())?;

    let nar_size = pass.r.pos();
    let raw_hash: Sha256 = pass.raw.finish().try_into().unwrap();
    let masked_hash: Sha256 = pass.masked.finish().try_into().unwrap();
    let self_ref = pass.analysis.has_self_refs();
    Ok(SourceCaResult {
        ca: ContentAddress::Source {
            hash: masked_hash,
            self_ref,
        },
        analysis: pass.analysis,
        nar_size,
        nar_hash: NarHash::new(raw_hash.digest_bytes()),
    })
}

struct Pass<'a, R> {
    r: CountingReader<R>,
    raw: Context,
    masked: Context,
    observer: Option<&'a mut dyn FnMut(&[u8])>,
    pattern: Option<[u8; DIGEST_LEN]>,
    analysis: SelfRefAnalysis,
}

impl<R: Read> Pass<'_, R> {
    /// Feed bytes that are hashed identically in raw and masked form.
    fn feed_plain(&mut self, bytes: &[u8]) {
        self.raw.update(bytes);
        self.masked.update(bytes);
        if let Some(observer) = self.observer.as_deref_mut() {
            observer(bytes);
        }
    }

    /// Feed raw-side only; the caller decides what the masked side sees.
    fn feed_raw(&mut self, bytes: &[u8]) {
        self.raw.update(bytes);
        if let Some(observer) = self.observer.as_deref_mut() {
            observer(bytes);
        }
    }

    fn read_u64_plain(&mut self) -> Result<u64, NarError> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        self.feed_plain(&buf);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bytes_plain(&mut self, limit: u64) -> Result<Vec<u8>, NarError> {
        let offset = self.r.pos();
        let len = self.read_u64_plain()?;
        if len > limit {
            return Err(NarError::StringTooLong { offset, length: len });
        }
        let mut buf = vec![0u8; len as usize];
        self.r.read_exact(&mut buf)?;
        self.feed_plain(&buf);
        self.read_padding_plain(len)?;
        Ok(buf)
    }

    fn read_padding_plain(&mut self, len: u64) -> Result<(), NarError> {
        let pad = wire::padding_len(len);
        if pad > 0 {
            let offset = self.r.pos();
            let mut buf = [0u8; 8];
            self.r.read_exact(&mut buf[..pad])?;
            if buf[..pad].iter().any(|&b| b != 0) {
                return Err(NarError::BadPadding(offset));
            }
            self.feed_plain(&buf[..pad]);
        }
        Ok(())
    }

    fn expect_token_plain(&mut self, expected: &'static str) -> Result<(), NarError> {
        let offset = self.r.pos();
        let got = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
        if got != expected.as_bytes() {
            return Err(NarError::UnexpectedToken { offset, expected });
        }
        Ok(())
    }

    fn node(&mut self, path: &Path) -> Result<(), NarError> {
        self.expect_token_plain("(")?;
        self.expect_token_plain("type")?;

        let offset = self.r.pos();
        let node_type = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
        match node_type.as_slice() {
            b"regular" => {
                let offset = self.r.pos();
                let mut token = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
                if token == b"executable" {
                    self.expect_token_plain("")?;
                    token = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
                }
                if token != b"contents" {
                    return Err(NarError::UnexpectedToken {
                        offset,
                        expected: "contents",
                    });
                }
                let size = self.read_u64_plain()?;
                let content_offset = self.r.pos();
                self.analysis.files.push(FileRegion {
                    path: path.to_owned(),
                    content_offset,
                    size,
                });
                self.contents(path, size)?;
                self.read_padding_plain(size)?;
            }
            b"symlink" => {
                self.expect_token_plain("target")?;
                let offset = self.r.pos();
                let len = self.read_u64_plain()?;
                if len > wire::MAX_STRING_LEN {
                    return Err(NarError::StringTooLong { offset, length: len });
                }
                let mut target = vec![0u8; len as usize];
                self.r.read_exact(&mut target)?;
                self.feed_raw(&target);
                if let Some(masked) = self.mask_in_memory(&target) {
                    self.analysis.symlinks.push(path.to_owned());
                    self.masked.update(&masked);
                } else {
                    self.masked.update(&target);
                }
                self.read_padding_plain(len)?;
            }
            b"directory" => loop {
                let offset = self.r.pos();
                let token = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
                match token.as_slice() {
                    b")" => return Ok(()),
                    b"entry" => {
                        self.expect_token_plain("(")?;
                        self.expect_token_plain("name")?;
                        let name = self.read_bytes_plain(wire::MAX_STRING_LEN)?;
                        self.expect_token_plain("node")?;
                        self.node(&path.join(name_to_os(&name)))?;
                        self.expect_token_plain(")")?;
                    }
                    _ => {
                        return Err(NarError::UnexpectedToken {
                            offset,
                            expected: "entry or )",
                        });
                    }
                }
            },
            _ => {
                return Err(NarError::UnexpectedToken {
                    offset,
                    expected: "regular, symlink, or directory",
                });
            }
        }

        self.expect_token_plain(")")?;
        Ok(())
    }

    /// Stream one file's contents, masking digest occurrences.
    ///
    /// Occurrences may span internal read-chunk boundaries, so the scanner
    /// holds back the last `DIGEST_LEN - 1` bytes of each chunk until more
    /// data (or end of region) resolves them.
    fn contents(&mut self, path: &Path, size: u64) -> Result<(), NarError> {
        let Some(pattern) = self.pattern else {
            // No self digest to look for: plain tee.
            let mut remaining = size;
            let mut buf = [0u8; 64 * 1024];
            while remaining > 0 {
                let n = remaining.min(buf.len() as u64) as usize;
                self.r.read_exact(&mut buf[..n])?;
                self.feed_plain(&buf[..n]);
                remaining -= n as u64;
            }
            return Ok(());
        };

        let mut carry: Vec<u8> = Vec::with_capacity(2 * DIGEST_LEN);
        let mut region_pos: u64 = 0;
        let mut remaining = size;
        let mut buf = [0u8; 64 * 1024];
        let mut masked_out: Vec<u8> = Vec::with_capacity(64 * 1024 + DIGEST_LEN);

        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.r.read_exact(&mut buf[..n])?;
            remaining -= n as u64;
            self.feed_raw(&buf[..n]);

            carry.extend_from_slice(&buf[..n]);
            let at_end = remaining == 0;
            let emit_end = if at_end {
                carry.len()
            } else {
                carry.len().saturating_sub(DIGEST_LEN - 1)
            };

            masked_out.clear();
            let mut i = 0;
            while i < emit_end {
                if i + DIGEST_LEN <= carry.len() && carry[i..i + DIGEST_LEN] == pattern {
                    self.analysis.rewrites.push(Rewrite {
                        path: path.to_owned(),
                        offset: region_pos + i as u64,
                    });
                    masked_out.extend_from_slice(&MASK);
                    i += DIGEST_LEN;
                } else {
                    masked_out.push(carry[i]);
                    i += 1;
                }
            }
            self.masked.update(&masked_out);
            region_pos += i as u64;
            carry.drain(..i);
        }
        // size == 0 leaves nothing buffered; otherwise the final at_end
        // round drained the carry completely.
        debug_assert!(carry.is_empty());
        Ok(())
    }

    fn mask_in_memory(&self, data: &[u8]) -> Option<Vec<u8>> {
        let pattern = self.pattern.as_ref()?;
        let mut out: Option<Vec<u8>> = None;
        let mut i = 0;
        while i + DIGEST_LEN <= data.len() {
            if &data[i..i + DIGEST_LEN] == pattern {
                let out = out.get_or_insert_with(|| data.to_vec());
                out[i..i + DIGEST_LEN].copy_from_slice(&MASK);
                i += DIGEST_LEN;
            } else {
                i += 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::dump;
    use std::fs;
    use tempfile::TempDir;

    fn digest() -> StorePathDigest {
        "ac8da0sqpg4pyhzyr0qgl26d5dnpn7qp".parse().unwrap()
    }

    #[test]
    fn test_no_self_refs() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "Hello, World!\n").unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &file).unwrap();

        let result = source_ca(
            &nar[..],
            SourceCaOptions {
                self_digest: Some(digest()),
                raw_observer: None,
            },
        )
        .unwrap();

        assert_eq!(result.nar_size as usize, nar.len());
        assert!(!result.analysis.has_self_refs());
        assert!(!result.ca.has_self_ref());
        // Without occurrences, masked and raw hashes agree.
        assert_eq!(
            result.ca.hash().digest_bytes(),
            result.nar_hash.digest_bytes()
        );
        assert_eq!(result.analysis.files.len(), 1);
    }

    #[test]
    fn test_self_ref_masked_and_recorded() {
        let dir = TempDir::new().unwrap();
        let d = digest();

        // Two trees identical except for which digest they embed; after
        // masking, their source addresses must agree.
        let make = |dig: &str| {
            let root = dir.path().join(format!("tree-{dig}"));
            fs::create_dir(&root).unwrap();
            fs::write(
                root.join("script"),
                format!("#!/bin/sh\nexec /zb/store/{dig}-self/bin/x\n"),
            )
            .unwrap();
            let mut nar = Vec::new();
            dump(&mut nar, &root).unwrap();
            nar
        };

        let nar_a = make(d.as_str());
        let other: StorePathDigest = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".parse().unwrap();
        let nar_b = make(other.as_str());

        let result_a = source_ca(
            &nar_a[..],
            SourceCaOptions {
                self_digest: Some(d),
                raw_observer: None,
            },
        )
        .unwrap();
        let result_b = source_ca(
            &nar_b[..],
            SourceCaOptions {
                self_digest: Some(other),
                raw_observer: None,
            },
        )
        .unwrap();

        assert!(result_a.ca.has_self_ref());
        assert_eq!(result_a.ca, result_b.ca);
        assert_eq!(result_a.analysis.rewrites.len(), 1);
        let rewrite = &result_a.analysis.rewrites[0];
        assert_eq!(rewrite.path, PathBuf::from("script"));
        // The occurrence offset points at the digest within the file.
        let contents = format!("#!/bin/sh\nexec /zb/store/{}-self/bin/x\n", d);
        assert_eq!(
            &contents.as_bytes()
                [rewrite.offset as usize..rewrite.offset as usize + DIGEST_LEN],
            d.as_bytes()
        );
    }

    #[test]
    fn test_symlink_self_ref() {
        let dir = TempDir::new().unwrap();
        let d = digest();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(
            format!("/zb/store/{d}-self/data"),
            root.join("link"),
        )
        .unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &root).unwrap();

        let result = source_ca(
            &nar[..],
            SourceCaOptions {
                self_digest: Some(d),
                raw_observer: None,
            },
        )
        .unwrap();
        #[cfg(unix)]
        {
            assert!(result.ca.has_self_ref());
            assert_eq!(result.analysis.symlinks, vec![PathBuf::from("link")]);
        }
    }

    #[test]
    fn test_raw_observer_sees_all_bytes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x");
        fs::write(&file, "payload").unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &file).unwrap();

        let mut seen = Vec::new();
        let mut observer = |chunk: &[u8]| seen.extend_from_slice(chunk);
        source_ca(
            &nar[..],
            SourceCaOptions {
                self_digest: None,
                raw_observer: Some(&mut observer),
            },
        )
        .unwrap();
        assert_eq!(seen, nar);
    }

    /// An occurrence that spans the internal 64 KiB chunk boundary is
    /// still found and masked.
    #[test]
    fn test_occurrence_across_chunk_boundary() {
        let dir = TempDir::new().unwrap();
        let d = digest();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();

        // Lay out the digest so it straddles the 64 KiB read boundary of
        // the content region.
        let mut data = vec![b'x'; 64 * 1024 - 16];
        data.extend_from_slice(d.as_str().as_bytes());
        data.extend_from_slice(b"tail");
        fs::write(root.join("big"), &data).unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &root).unwrap();

        let result = source_ca(
            &nar[..],
            SourceCaOptions {
                self_digest: Some(d),
                raw_observer: None,
            },
        )
        .unwrap();
        assert_eq!(result.analysis.rewrites.len(), 1);
        assert_eq!(result.analysis.rewrites[0].offset, 64 * 1024 - 16);
    }
}
