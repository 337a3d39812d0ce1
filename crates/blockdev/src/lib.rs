// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Block device query APIs
//!
//! Everything here shells out to the standard partition tooling (`lsblk`,
//! `blkid`, `grub-probe`, `os-prober`) and parses its output. The parsers
//! are kept free of subprocess plumbing so they can be tested against
//! captured tool output.

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
};

use thiserror::Error;

pub mod lsblk;
pub mod osprober;

pub use lsblk::{device_by_uuid, label_uuid_map, mountpoint_by_label, uuid_by_label, BlockDeviceInfo};
pub use osprober::probe_foreign_os_roots;

/// Basic errors in block device queries
#[derive(Debug, Error)]
pub enum Error {
    #[error("no block device with uuid {0:?}")]
    UnknownUuid(String),

    #[error("no block device with label {0:?}")]
    UnknownLabel(String),

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("os-prober did not finish in time")]
    Timeout,

    #[error("from io: {0}")]
    IO(#[from] io::Error),
}

/// Run a query tool and capture its stdout, surfacing stderr on failure
pub(crate) fn tool_output(cmd: &mut Command, what: &str) -> Result<String, Error> {
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(Error::Enumeration(format!(
            "{what}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Filesystem UUID of a block device, via `grub-probe`
pub fn uuid_of_device(device: impl AsRef<Path>) -> Result<String, Error> {
    let out = tool_output(
        Command::new("grub-probe")
            .arg("-t")
            .arg("fs_uuid")
            .arg("-d")
            .arg(device.as_ref()),
        "grub-probe",
    )?;
    Ok(out.trim().to_string())
}

/// Filesystem UUID of the mounted root
pub fn root_fs_uuid() -> Result<String, Error> {
    let out = tool_output(
        Command::new("grub-probe").arg("-t").arg("fs_uuid").arg("/"),
        "grub-probe",
    )?;
    Ok(out.trim().to_string())
}

/// Partition label of a block device, via `blkid`
pub fn label_of_device(device: impl AsRef<Path>) -> Result<String, Error> {
    let out = tool_output(
        Command::new("blkid")
            .arg("-o")
            .arg("value")
            .arg("-s")
            .arg("LABEL")
            .arg(device.as_ref()),
        "blkid",
    )?;
    Ok(out.trim().to_string())
}

/// The disk device housing an arbitrary path, e.g. `/dev/sda` for `/`
pub fn disk_of_path(path: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let out = tool_output(
        Command::new("grub-probe").arg("-t").arg("disk").arg(path.as_ref()),
        "grub-probe",
    )?;
    let disk = PathBuf::from(out.trim());
    // grub-probe may name a device node that no longer exists
    std::fs::metadata(&disk)?;
    Ok(disk)
}

/// Whether the kernel currently exposes a device with this filesystem UUID
pub fn uuid_has_device(uuid: &str) -> bool {
    if uuid.is_empty() {
        return false;
    }
    Path::new("/dev/disk/by-uuid").join(uuid).exists()
}
