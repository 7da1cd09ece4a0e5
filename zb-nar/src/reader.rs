// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Event-driven parsing of the canonical archive format.
//!
//! [`parse`] walks an archive stream and reports each node to a
//! [`NarSink`], carrying the absolute byte offset of file contents and
//! symlink targets within the outer stream. Consumers use the offsets for
//! reference scanning and in-place rewrites.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::NarError;
use crate::wire::{self, CountingReader};

/// Receiver for parsed archive nodes.
///
/// Paths are relative to the archive root; the root node itself has an
/// empty path. For files, `contents` must be fully consumed (the parser
/// drains any remainder).
pub trait NarSink {
    fn file(
        &mut self,
        path: &Path,
        executable: bool,
        size: u64,
        content_offset: u64,
        contents: &mut dyn Read,
    ) -> io::Result<()>;

    fn directory(&mut self, path: &Path) -> io::Result<()>;

    fn symlink(&mut self, path: &Path, target: &[u8], target_offset: u64) -> io::Result<()>;
}

/// Parse one archive from `r`, reporting nodes to `sink`.
///
/// Returns the total number of bytes consumed. Rejects non-canonical
/// input: unknown tokens, non-zero padding, unsorted or invalid entry
/// names.
pub fn parse<R: Read, S: NarSink + ?Sized>(r: R, sink: &mut S) -> Result<u64, NarError> {
    let mut r = CountingReader::new(r);
    let magic = r.read_bytes(wire::MAX_STRING_LEN)?;
    if magic != wire::MAGIC {
        return Err(NarError::BadMagic);
    }
    parse_node(&mut r, sink, &PathBuf::new())?;
    Ok(r.pos())
}

fn parse_node<R: Read, S: NarSink + ?Sized>(
    r: &mut CountingReader<R>,
    sink: &mut S,
    path: &Path,
) -> Result<(), NarError> {
    r.expect_token("(")?;
    r.expect_token("type")?;

    let offset = r.pos();
    let node_type = r.read_bytes(wire::MAX_STRING_LEN)?;
    match node_type.as_slice() {
        b"regular" => {
            let offset = r.pos();
            let mut token = r.read_bytes(wire::MAX_STRING_LEN)?;
            let executable = if token == b"executable" {
                r.expect_token("")?;
                token = r.read_bytes(wire::MAX_STRING_LEN)?;
                true
            } else {
                false
            };
            if token != b"contents" {
                return Err(NarError::UnexpectedToken {
                    offset,
                    expected: "contents",
                });
            }
            let size = r.read_u64()?;
            let content_offset = r.pos();
            {
                let mut contents = ContentReader {
                    inner: r,
                    remaining: size,
                };
                sink.file(path, executable, size, content_offset, &mut contents)?;
                // Drain whatever the sink left unread.
                io::copy(&mut contents, &mut io::sink())?;
            }
            r.read_padding(size)?;
        }
        b"symlink" => {
            r.expect_token("target")?;
            let target_offset = r.pos() + 8;
            let target = r.read_bytes(wire::MAX_STRING_LEN)?;
            sink.symlink(path, &target, target_offset)?;
        }
        b"directory" => {
            sink.directory(path)?;
            let mut previous_name: Option<Vec<u8>> = None;
            loop {
                let offset = r.pos();
                let token = r.read_bytes(wire::MAX_STRING_LEN)?;
                match token.as_slice() {
                    b")" => return Ok(()),
                    b"entry" => {
                        r.expect_token("(")?;
                        r.expect_token("name")?;
                        let name = r.read_bytes(wire::MAX_STRING_LEN)?;
                        check_entry_name(&name)?;
                        if let Some(prev) = &previous_name
                            && prev >= &name
                        {
                            return Err(NarError::UnsortedEntries(
                                String::from_utf8_lossy(&name).into_owned(),
                                String::from_utf8_lossy(prev).into_owned(),
                            ));
                        }
                        previous_name = Some(name.clone());
                        r.expect_token("node")?;
                        parse_node(r, sink, &path.join(name_to_os(&name)))?;
                        r.expect_token(")")?;
                    }
                    _ => {
                        return Err(NarError::UnexpectedToken {
                            offset,
                            expected: "entry or )",
                        });
                    }
                }
            }
        }
        _ => {
            return Err(NarError::UnexpectedToken {
                offset,
                expected: "regular, symlink, or directory",
            });
        }
    }

    r.expect_token(")")?;
    Ok(())
}

fn check_entry_name(name: &[u8]) -> Result<(), NarError> {
    if name.is_empty()
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
        || name.contains(&0)
    {
        return Err(NarError::BadEntryName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

pub(crate) fn name_to_os(name: &[u8]) -> std::ffi::OsString {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        std::ffi::OsString::from_vec(name.to_vec())
    }
    #[cfg(not(unix))]
    {
        String::from_utf8_lossy(name).into_owned().into()
    }
}

/// Bounded reader over the current file's contents.
struct ContentReader<'a, R> {
    inner: &'a mut CountingReader<R>,
    remaining: u64,
}

impl<R: Read> Read for ContentReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let n = buf.len().min(self.remaining as usize).min(64 * 1024);
        self.inner.read_exact(&mut buf[..n])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::dump;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collector {
        events: Vec<String>,
        offsets: Vec<(PathBuf, u64, u64)>,
    }

    impl NarSink for Collector {
        fn file(
            &mut self,
            path: &Path,
            executable: bool,
            size: u64,
            content_offset: u64,
            contents: &mut dyn Read,
        ) -> io::Result<()> {
            let mut data = Vec::new();
            contents.read_to_end(&mut data)?;
            self.events.push(format!(
                "file {} exec={} {:?}",
                path.display(),
                executable,
                String::from_utf8_lossy(&data)
            ));
            self.offsets.push((path.to_owned(), content_offset, size));
            Ok(())
        }

        fn directory(&mut self, path: &Path) -> io::Result<()> {
            self.events.push(format!("dir {}", path.display()));
            Ok(())
        }

        fn symlink(&mut self, path: &Path, target: &[u8], _target_offset: u64) -> io::Result<()> {
            self.events.push(format!(
                "symlink {} -> {}",
                path.display(),
                String::from_utf8_lossy(target)
            ));
            Ok(())
        }
    }

    #[test]
    fn test_parse_reports_offsets() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "Hello, World!\n").unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &file).unwrap();

        let mut collector = Collector::default();
        let consumed = parse(&nar[..], &mut collector).unwrap();
        assert_eq!(consumed as usize, nar.len());

        let (_, offset, size) = collector.offsets[0];
        assert_eq!(size, 14);
        assert_eq!(
            &nar[offset as usize..(offset + size) as usize],
            b"Hello, World!\n"
        );
    }

    #[test]
    fn test_parse_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", root.join("link")).unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &root).unwrap();

        let mut collector = Collector::default();
        parse(&nar[..], &mut collector).unwrap();
        assert_eq!(collector.events[0], "dir ");
        assert!(collector.events.contains(&"file a.txt exec=false \"a\"".to_owned()));
        #[cfg(unix)]
        assert!(collector.events.contains(&"symlink link -> a.txt".to_owned()));
        assert!(collector.events.contains(&"dir sub".to_owned()));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut nar = Vec::new();
        wire::write_token(&mut nar, "not-an-archive").unwrap();
        let mut collector = Collector::default();
        assert!(matches!(
            parse(&nar[..], &mut collector),
            Err(NarError::BadMagic)
        ));
    }

    #[test]
    fn test_parse_rejects_unsorted_entries() {
        // Hand-assemble a directory with entries out of order.
        let mut nar = Vec::new();
        for t in ["nix-archive-1", "(", "type", "directory"] {
            wire::write_token(&mut nar, t).unwrap();
        }
        for name in ["b", "a"] {
            wire::write_token(&mut nar, "entry").unwrap();
            wire::write_token(&mut nar, "(").unwrap();
            wire::write_token(&mut nar, "name").unwrap();
            wire::write_token(&mut nar, name).unwrap();
            wire::write_token(&mut nar, "node").unwrap();
            for t in ["(", "type", "regular", "contents"] {
                wire::write_token(&mut nar, t).unwrap();
            }
            wire::write_bytes(&mut nar, b"").unwrap();
            wire::write_token(&mut nar, ")").unwrap();
            wire::write_token(&mut nar, ")").unwrap();
        }
        wire::write_token(&mut nar, ")").unwrap();

        let mut collector = Collector::default();
        assert!(matches!(
            parse(&nar[..], &mut collector),
            Err(NarError::UnsortedEntries(..))
        ));
    }
}
