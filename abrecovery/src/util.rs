// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Small system helpers shared by the orchestrators

use std::{
    fs, io,
    io::Write,
    path::{Component, Path, PathBuf},
};

use tempfile::NamedTempFile;

/// Machine and kernel release, from `uname(2)`
#[derive(Debug)]
pub struct UtsName {
    pub machine: String,
    pub release: String,
}

pub fn uname() -> io::Result<UtsName> {
    let uts = nix::sys::utsname::uname()?;
    Ok(UtsName {
        machine: uts.machine().to_string_lossy().into_owned(),
        release: uts.release().to_string_lossy().into_owned(),
    })
}

/// Kernel boot options of the running system
pub fn read_boot_options() -> io::Result<String> {
    fs::read_to_string("/proc/cmdline")
}

/// Materialise the rsync exclusion list as a temp file.
///
/// The returned handle deletes the file when dropped, which covers the
/// deferred cleanup on every exit path of the backup run.
pub fn write_exclude_file(items: &[&str]) -> io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix("deepin-recovery-").tempfile()?;
    for item in items {
        writeln!(file, "{item}")?;
    }
    file.flush()?;
    Ok(file)
}

/// Whether `path` itself is a symbolic link
pub fn is_symlink(path: impl AsRef<Path>) -> io::Result<bool> {
    Ok(fs::symlink_metadata(path)?.file_type().is_symlink())
}

/// Join `path` under `root` even when `path` is absolute
pub fn join_under(root: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = root.as_ref().to_path_buf();
    for comp in path.as_ref().components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Lexically normalize a path, dropping `.` and trailing separators
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}
