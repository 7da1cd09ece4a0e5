// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Freezing store objects: read-only permissions, epoch timestamps.
//!
//! Runs after an object lands in the store (import or build
//! post-processing). Individual failures are logged and skipped so a
//! partially frozen object never blocks registration.

use std::ffi::CString;
use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

/// Set atime and mtime on `path` without following symlinks.
#[allow(unsafe_code)]
fn set_timestamp(path: &Path, seconds: i64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt as _;
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let times = [
            libc::timespec {
                tv_sec: seconds,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: seconds,
                tv_nsec: 0,
            },
        ];
        // SAFETY: c_path is a valid null-terminated string and times is a
        // valid 2-element array. AT_SYMLINK_NOFOLLOW prevents following
        // symlinks.
        let ret = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c_path.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (path, seconds);
        Ok(())
    }
}

fn freeze_entry(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;

    // Symlinks have no independent permissions or timestamps.
    if !metadata.is_symlink() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = metadata.permissions().mode();
            let new_mode = mode & !0o222;
            if new_mode != mode {
                fs::set_permissions(path, fs::Permissions::from_mode(new_mode))?;
            }
        }
        set_timestamp(path, 0)?;
    }
    Ok(())
}

/// Recursively make `root` read-only with epoch mtimes, continuing past
/// individual errors.
pub fn freeze(root: &Path) {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("freeze walk error under {}: {e}", root.display());
                continue;
            }
        };
        if let Err(e) = freeze_entry(entry.path()) {
            warn!("failed to freeze {}: {e}", entry.path().display());
        }
    }
}

/// Re-open a frozen tree for mutation (used before deleting an object).
pub fn thaw(root: &Path) {
    for entry in WalkDir::new(root) {
        let Ok(entry) = entry else { continue };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            if let Ok(metadata) = fs::symlink_metadata(entry.path())
                && !metadata.is_symlink()
            {
                let mode = metadata.permissions().mode();
                let _ = fs::set_permissions(
                    entry.path(),
                    fs::Permissions::from_mode(mode | 0o200),
                );
            }
        }
    }
}
