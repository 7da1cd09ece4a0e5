// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Restoring an archive stream to the filesystem.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::NarError;
use crate::reader::{NarSink, parse};

struct Restorer {
    root: PathBuf,
}

impl Restorer {
    fn target_path(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl NarSink for Restorer {
    fn file(
        &mut self,
        path: &Path,
        executable: bool,
        _size: u64,
        _content_offset: u64,
        contents: &mut dyn Read,
    ) -> io::Result<()> {
        let dest = self.target_path(path);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(if executable { 0o777 } else { 0o666 });
        }
        #[cfg(not(unix))]
        let _ = executable;
        let mut file = options.open(&dest)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = contents.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
        }
        file.flush()
    }

    fn directory(&mut self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(self.target_path(path))
    }

    fn symlink(&mut self, path: &Path, target: &[u8], _target_offset: u64) -> io::Result<()> {
        let dest = self.target_path(path);
        #[cfg(unix)]
        {
            let target_os = crate::reader::name_to_os(target);
            std::os::unix::fs::symlink(target_os, dest)
        }
        #[cfg(not(unix))]
        {
            let _ = (dest, target);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "symlinks are not supported on this platform",
            ))
        }
    }
}

/// Restore an archive stream into `dest`.
///
/// `dest` must not exist; its parent directory must. On error a partially
/// extracted tree may remain; callers remove it.
pub fn extract<R: Read>(r: R, dest: &Path) -> Result<(), NarError> {
    let mut restorer = Restorer {
        root: dest.to_owned(),
    };
    parse(r, &mut restorer)?;
    Ok(())
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::dump;
    use std::fs;
    use tempfile::TempDir;

    /// Round-trip: dump a tree, extract it, dump again; byte-identical.
    #[test]
    fn test_extract_dump_roundtrip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::create_dir(root.join("bin")).unwrap();
        fs::write(root.join("bin/tool"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
            std::os::unix::fs::symlink("bin/tool", root.join("link")).unwrap();
        }

        let mut nar = Vec::new();
        dump(&mut nar, &root).unwrap();

        let out = dir.path().join("out");
        extract(&nar[..], &out).unwrap();

        let mut nar2 = Vec::new();
        dump(&mut nar2, &out).unwrap();
        assert_eq!(nar, nar2);
    }

    #[test]
    fn test_extract_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "Hello, World!\n").unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &file).unwrap();

        let out = dir.path().join("restored");
        extract(&nar[..], &out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "Hello, World!\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0, "no execute bits expected");
        }
    }

    #[test]
    fn test_extract_refuses_existing_dest() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "x").unwrap();

        let mut nar = Vec::new();
        dump(&mut nar, &file).unwrap();

        let out = dir.path().join("exists");
        fs::write(&out, "already here").unwrap();
        assert!(extract(&nar[..], &out).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::dump;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    proptest! {
        /// Any tree of files survives a dump → extract → dump round trip
        /// byte for byte.
        #[test]
        fn proptest_dump_extract_roundtrip(
            files in proptest::collection::btree_map(
                "[a-z][a-z0-9]{0,8}",
                (proptest::collection::vec(any::<u8>(), 0..512), any::<bool>()),
                0..8,
            ),
        ) {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("tree");
            fs::create_dir(&root).unwrap();
            for (name, (content, executable)) in &files {
                let path = root.join(name);
                fs::write(&path, content).unwrap();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt as _;
                    let mode = if *executable { 0o755 } else { 0o644 };
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
                }
            }

            let mut nar = Vec::new();
            dump(&mut nar, &root).unwrap();

            let out = dir.path().join("out");
            extract(&nar[..], &out).unwrap();

            let mut nar2 = Vec::new();
            dump(&mut nar2, &out).unwrap();
            prop_assert_eq!(nar, nar2);
        }
    }
}
