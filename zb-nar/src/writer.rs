// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Serializing a filesystem subtree into the canonical archive format.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::NarError;
use crate::wire;

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Serialize the filesystem subtree at `root` into `w`.
///
/// The walk is in strict byte-sorted order, so the emitted stream is
/// byte-for-byte reproducible for identical trees. Returns the number of
/// bytes written.
pub fn dump<W: Write + ?Sized>(w: &mut W, root: &Path) -> Result<u64, NarError> {
    let mut w = CountingWriter {
        inner: w,
        written: 0,
    };
    wire::write_token(&mut w, "nix-archive-1")?;
    dump_node(&mut w, root)?;
    w.flush()?;
    Ok(w.written)
}

fn dump_node<W: Write>(w: &mut W, path: &Path) -> Result<(), NarError> {
    let meta = fs::symlink_metadata(path).map_err(|e| NarError::fs("stat", path, e))?;
    let file_type = meta.file_type();

    wire::write_token(w, "(")?;
    if file_type.is_file() {
        wire::write_token(w, "type")?;
        wire::write_token(w, "regular")?;
        #[cfg(unix)]
        let executable = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o100 != 0
        };
        #[cfg(not(unix))]
        let executable = false;
        if executable {
            wire::write_token(w, "executable")?;
            wire::write_token(w, "")?;
        }
        wire::write_token(w, "contents")?;
        dump_contents(w, path, meta.len())?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(path).map_err(|e| NarError::fs("readlink", path, e))?;
        wire::write_token(w, "type")?;
        wire::write_token(w, "symlink")?;
        wire::write_token(w, "target")?;
        #[cfg(unix)]
        let target_bytes = {
            use std::os::unix::ffi::OsStrExt;
            target.as_os_str().as_bytes().to_vec()
        };
        #[cfg(not(unix))]
        let target_bytes = target.to_string_lossy().into_owned().into_bytes();
        wire::write_bytes(w, &target_bytes)?;
    } else if file_type.is_dir() {
        wire::write_token(w, "type")?;
        wire::write_token(w, "directory")?;

        let mut names: Vec<Vec<u8>> = Vec::new();
        let entries = fs::read_dir(path).map_err(|e| NarError::fs("readdir", path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| NarError::fs("readdir", path, e))?;
            #[cfg(unix)]
            let name = {
                use std::os::unix::ffi::OsStrExt;
                entry.file_name().as_bytes().to_vec()
            };
            #[cfg(not(unix))]
            let name = entry.file_name().to_string_lossy().into_owned().into_bytes();
            names.push(name);
        }
        names.sort();

        for name in names {
            wire::write_token(w, "entry")?;
            wire::write_token(w, "(")?;
            wire::write_token(w, "name")?;
            wire::write_bytes(w, &name)?;
            wire::write_token(w, "node")?;
            let name_os = bytes_to_os(&name);
            dump_node(w, &path.join(name_os))?;
            wire::write_token(w, ")")?;
        }
    } else {
        return Err(NarError::UnsupportedFileType(path.to_owned()));
    }
    wire::write_token(w, ")")?;
    Ok(())
}

fn dump_contents<W: Write>(w: &mut W, path: &Path, size: u64) -> Result<(), NarError> {
    wire::write_u64(w, size)?;
    let mut file = fs::File::open(path).map_err(|e| NarError::fs("open", path, e))?;
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| NarError::fs("read", path, e))?;
        if n == 0 {
            break;
        }
        total += n as u64;
        w.write_all(&buf[..n])?;
    }
    // The size was taken from the stat above; a concurrent mutation would
    // desynchronize the stream framing.
    if total != size {
        return Err(NarError::fs(
            "read",
            path,
            io::Error::new(io::ErrorKind::InvalidData, "file changed while dumping"),
        ));
    }
    w.write_all(&[0u8; 8][..wire::padding_len(size)])?;
    Ok(())
}

fn bytes_to_os(name: &[u8]) -> std::ffi::OsString {
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

#[cfg(test)]
mod unittests {
    use super::*;
    use hex_literal::hex;
    use tempfile::TempDir;

    /// The canonical serialization of a single 14-byte file, assembled
    /// token by token for comparison.
    #[test]
    fn test_dump_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "Hello, World!\n").unwrap();

        let mut out = Vec::new();
        let size = dump(&mut out, &file).unwrap();
        assert_eq!(size as usize, out.len());
        assert_eq!(out.len() % 8, 0);

        let mut expected = Vec::new();
        for token in ["nix-archive-1", "(", "type", "regular", "contents"] {
            wire::write_token(&mut expected, token).unwrap();
        }
        wire::write_bytes(&mut expected, b"Hello, World!\n").unwrap();
        wire::write_token(&mut expected, ")").unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_dump_is_reproducible_and_sorted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/c.txt"), "c").unwrap();

        let mut first = Vec::new();
        dump(&mut first, &root).unwrap();
        let mut second = Vec::new();
        dump(&mut second, &root).unwrap();
        assert_eq!(first, second);

        // "a.txt" must be serialized before "b.txt".
        let a_pos = first.windows(5).position(|w| w == b"a.txt").unwrap();
        let b_pos = first.windows(5).position(|w| w == b"b.txt").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn test_known_digest() {
        // sha256 of the NAR of a file containing "Hello, World!\n",
        // cross-checked against an independent implementation.
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "Hello, World!\n").unwrap();

        let mut out = Vec::new();
        dump(&mut out, &file).unwrap();
        let hash = zb_utils_hash::Sha256::digest(&out);
        assert_eq!(
            hash.digest_bytes(),
            hex!("c070aed9366c5b1ccf6c35187d7bcd0d5d3f5633794031753ad6b05a75edbb76")
        );
    }
}
