// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scoped mounting of the backup partition

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use crate::Error;

/// Whether `mountpoint` appears in `/proc/self/mounts`
pub fn is_mounted(mountpoint: &str) -> io::Result<bool> {
    let content = fs::read_to_string("/proc/self/mounts")?;
    Ok(mount_table_contains(&content, mountpoint))
}

pub fn mount_table_contains(data: &str, mountpoint: &str) -> bool {
    data.lines().any(|line| {
        let mut fields = line.splitn(3, ' ');
        fields.next().is_some() && fields.next() == Some(mountpoint)
    })
}

/// Whether `mountpoint` is mounted read-only
pub fn is_mounted_ro(mountpoint: &str) -> io::Result<bool> {
    let content = fs::read_to_string("/proc/self/mounts")?;
    Ok(mount_table_readonly(&content, mountpoint))
}

pub fn mount_table_readonly(data: &str, mountpoint: &str) -> bool {
    data.lines().any(|line| {
        let fields: Vec<&str> = line.split(' ').collect();
        fields.len() >= 4 && fields[1] == mountpoint && fields[3].split(',').any(|opt| opt == "ro")
    })
}

/// Unmount `dir` and remove the mountpoint directory, logging failures.
/// Used on mountpoints we do not hold a guard for.
pub fn unmount_and_remove(dir: impl AsRef<Path>) {
    let dir = dir.as_ref();
    if let Err(e) = run_umount(dir) {
        log::warn!("failed to umount directory {:?}: {e}", dir);
    }
    if let Err(e) = fs::remove_dir(dir) {
        log::warn!("failed to remove unmounted directory: {e}");
    }
}

fn run_umount(dir: &Path) -> Result<(), String> {
    let status = Command::new("umount")
        .arg(dir)
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("umount exited with {status}"))
    }
}

/// Encapsulated mountpoint to ensure auto-unmount (Scoped)
///
/// Any stale mount at `dir` is detached first, the directory is created
/// with mode 0755, and the device is mounted there. Dropping the guard
/// unmounts and removes the directory; release failures are logged, never
/// raised.
#[derive(Debug)]
pub struct ScopedMount {
    point: PathBuf,
}

impl ScopedMount {
    pub fn mount(device: impl AsRef<Path>, dir: impl AsRef<Path>) -> Result<Self, Error> {
        let device = device.as_ref();
        let dir = dir.as_ref();

        if is_mounted(&dir.to_string_lossy())? {
            run_umount(dir).map_err(|e| Error::Unmount(dir.to_path_buf(), e))?;
        }

        if let Err(e) = fs::create_dir(dir) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }

        let status = Command::new("mount").arg(device).arg(dir).status()?;
        if !status.success() {
            let _ = fs::remove_dir(dir);
            return Err(Error::Mount(
                device.to_path_buf(),
                format!("mount exited with {status}"),
            ));
        }
        log::debug!("mounted {} at {}", device.display(), dir.display());

        Ok(Self {
            point: dir.to_path_buf(),
        })
    }

    pub fn point(&self) -> &Path {
        &self.point
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        match run_umount(&self.point) {
            Ok(()) => log::debug!("unmounted {}", self.point.display()),
            Err(e) => log::warn!("failed to umount {}: {e}", self.point.display()),
        }
        if let Err(e) = fs::remove_dir(&self.point) {
            log::warn!("failed to remove mount point {}: {e}", self.point.display());
        }
    }
}
