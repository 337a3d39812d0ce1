// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! OS description and board facts
//!
//! The menu text needs a human readable OS description. The preferred
//! source is `/etc/os-version`; `lsb_release -a` is the fallback when that
//! file is absent or incomplete.

use std::{collections::HashMap, fs, io, process::Command};

pub const LSB_KEY_DESC: &str = "Description";
pub const LSB_KEY_RELEASE: &str = "Release";

const OS_KEY_SYSTEM_NAME: &str = "SystemName";
const OS_KEY_MAJOR_VERSION: &str = "MajorVersion";
const OS_KEY_EDITION_NAME: &str = "EditionName";

/// OS description and version for the boot menu and role config
#[derive(Debug, Clone)]
pub struct OsDescription {
    pub version: String,
    pub description: String,
}

impl Default for OsDescription {
    fn default() -> Self {
        Self {
            version: "unknown".to_string(),
            description: "Uos unknown".to_string(),
        }
    }
}

/// Gather the OS description, trying os-version before lsb_release.
/// Neither source being available is not fatal; defaults apply.
pub fn gather() -> OsDescription {
    let os_version = read_os_version();
    match os_version {
        Ok(info) => OsDescription {
            version: info.get(OS_KEY_MAJOR_VERSION).cloned().unwrap_or_default(),
            description: format!(
                "{} {} {}",
                info.get(OS_KEY_SYSTEM_NAME).map(String::as_str).unwrap_or_default(),
                info.get(OS_KEY_MAJOR_VERSION).map(String::as_str).unwrap_or_default(),
                info.get(OS_KEY_EDITION_NAME).map(String::as_str).unwrap_or_default()
            ),
        },
        Err(e) => {
            log::warn!("failed to read os-version: {e}");
            match run_lsb_release() {
                Ok(info) => OsDescription {
                    version: info.get(LSB_KEY_RELEASE).cloned().unwrap_or_default(),
                    description: info.get(LSB_KEY_DESC).cloned().unwrap_or_default(),
                },
                Err(e) => {
                    log::warn!("failed to run lsb-release: {e}");
                    OsDescription::default()
                }
            }
        }
    }
}

fn read_os_version() -> io::Result<HashMap<String, String>> {
    let content = fs::read_to_string("/etc/os-version")?;
    Ok(parse_os_version(&content))
}

pub fn parse_os_version(data: &str) -> HashMap<String, String> {
    data.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            if value.contains('=') {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn run_lsb_release() -> io::Result<HashMap<String, String>> {
    let output = Command::new("lsb_release").arg("-a").output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "lsb_release exited with {}",
            output.status
        )));
    }
    Ok(parse_lsb_release(&String::from_utf8_lossy(&output.stdout)))
}

pub fn parse_lsb_release(data: &str) -> HashMap<String, String> {
    data.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// BIOS facts from `/proc/boardinfo` on loongson boards
#[derive(Debug)]
pub struct BoardInfo {
    pub bios_version: String,
}

pub fn read_board_info() -> io::Result<BoardInfo> {
    let content = fs::read_to_string("/proc/boardinfo")?;
    Ok(parse_board_info(&content))
}

pub fn parse_board_info(data: &str) -> BoardInfo {
    let dict: HashMap<&str, &str> = data
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim(), value.trim()))
        })
        .collect();
    BoardInfo {
        bios_version: dict.get("Version").unwrap_or(&"").to_string(),
    }
}
