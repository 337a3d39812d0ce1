// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `lsblk` record parsing and lookups

use std::{collections::HashMap, path::PathBuf, process::Command};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::{tool_output, Error};

/// One record of `lsblk -J -o UUID,MOUNTPOINT,LABEL`
#[derive(Debug, Default, Deserialize)]
pub struct BlockDeviceInfo {
    #[serde(default)]
    pub uuid: Option<String>,

    #[serde(default)]
    pub mountpoint: Option<String>,

    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    blockdevices: Vec<BlockDeviceInfo>,
}

impl BlockDeviceInfo {
    fn label_matches(&self, label: &str) -> bool {
        self.label
            .as_deref()
            .is_some_and(|l| l.trim().eq_ignore_ascii_case(label))
    }
}

/// Decode the `blockdevices` array of `lsblk -J` output
pub fn parse_json_devices(data: &str) -> Result<Vec<BlockDeviceInfo>, Error> {
    let list: DeviceList =
        serde_json::from_str(data).map_err(|e| Error::Enumeration(format!("lsblk json: {e}")))?;
    Ok(list.blockdevices)
}

static PAIR_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r#"PATH="(.+)""#).unwrap());

/// Extract the PATH of the record carrying `uuid` from `lsblk -P` pair output
pub fn path_from_pair_output(out: &str, uuid: &str) -> Option<PathBuf> {
    if uuid.is_empty() {
        return None;
    }
    let needle = format!("UUID=\"{uuid}\"");
    let line = out.lines().find(|line| line.contains(&needle))?;
    let m = PAIR_PATH.captures(line)?;
    Some(PathBuf::from(&m[1]))
}

fn enumerate(extra: Option<&std::path::Path>) -> Result<Vec<BlockDeviceInfo>, Error> {
    let mut cmd = Command::new("lsblk");
    cmd.arg("-J").arg("-o").arg("UUID,MOUNTPOINT,LABEL");
    if let Some(disk) = extra {
        cmd.arg(disk);
    }
    let out = tool_output(&mut cmd, "lsblk")?;
    parse_json_devices(&out)
}

/// Resolve the block device path carrying the filesystem `uuid`
pub fn device_by_uuid(uuid: &str) -> Result<PathBuf, Error> {
    if uuid.is_empty() {
        return Err(Error::UnknownUuid(String::new()));
    }
    let out = tool_output(
        Command::new("lsblk").arg("-P").arg("-n").arg("-o").arg("UUID,PATH"),
        "lsblk",
    )?;
    path_from_pair_output(&out, uuid).ok_or_else(|| Error::UnknownUuid(uuid.to_string()))
}

/// Filesystem UUID of the partition labelled `label` (case-insensitive).
/// Empty when the partition carries no UUID.
pub fn uuid_by_label(label: &str) -> Result<String, Error> {
    let devices = enumerate(None)?;
    devices
        .iter()
        .find(|d| d.label_matches(label))
        .map(|d| d.uuid.clone().unwrap_or_default())
        .ok_or_else(|| Error::UnknownLabel(label.to_string()))
}

/// Mountpoint of the partition labelled `label` (case-insensitive).
/// Empty when the partition is not mounted.
pub fn mountpoint_by_label(label: &str) -> Result<String, Error> {
    let devices = enumerate(None)?;
    devices
        .iter()
        .find(|d| d.label_matches(label))
        .map(|d| d.mountpoint.clone().unwrap_or_default())
        .ok_or_else(|| Error::UnknownLabel(label.to_string()))
}

/// Build the well-known label → uuid map for the partitions of `disk`.
///
/// Only the first candidate for each key is kept, matching either by
/// label or by conventional mountpoint.
pub fn label_uuid_map(disk: impl AsRef<std::path::Path>) -> Result<HashMap<String, String>, Error> {
    let devices = enumerate(Some(disk.as_ref()))?;
    Ok(to_label_uuid_map(&devices))
}

pub fn to_label_uuid_map(devices: &[BlockDeviceInfo]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for device in devices {
        let Some(uuid) = device.uuid.as_deref() else {
            continue;
        };
        let mountpoint = device.mountpoint.as_deref().unwrap_or_default();
        if !out.contains_key("boot") && (device.label_matches("boot") || mountpoint == "/boot") {
            out.insert("boot".to_string(), uuid.to_string());
        } else if !out.contains_key("efi") && (device.label_matches("efi") || mountpoint == "/boot/efi") {
            out.insert("efi".to_string(), uuid.to_string());
        } else if !out.contains_key("recovery")
            && (device.label_matches("backup") || mountpoint == "/recovery")
        {
            out.insert("recovery".to_string(), uuid.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR_OUTPUT: &str = r#"UUID="" PATH="/dev/sda"
UUID="309ca993-66a3-469d-bb6e-22a4b2d800da" PATH="/dev/sda1"
UUID="eb5aaf62-4375-47a4-b518-68e3973b153e" PATH="/dev/sda2"
UUID="" PATH="/dev/sdb"
UUID="" PATH="/dev/sdb1"
UUID="" PATH="/dev/sr0"
UUID="cWU76A-fvpc-NlSD-Xw3z-G4qQ-4yWg-jDvnsj" PATH="/dev/mapper/luks_crypt0"
UUID="8b7aec2d-9084-4969-a13a-405d1d5ec82e" PATH="/dev/mapper/vg0-Roota"
UUID="e4376f24-55e9-4980-8d2e-003dde15ff83" PATH="/dev/mapper/vg0-Rootb"
UUID="55c8bfaf-89b1-4453-8780-7efa4ead39d5" PATH="/dev/mapper/vg0-_dde_data"
UUID="0a96531e-e9c0-4e9e-b01f-eb98c5f619bd" PATH="/dev/mapper/vg0-Backup"
UUID="1c461280-bf0c-451f-8033-3e1041b71e6e" PATH="/dev/mapper/vg0-SWAP"
"#;

    #[test]
    fn pair_output_lookup() {
        let path = path_from_pair_output(PAIR_OUTPUT, "e4376f24-55e9-4980-8d2e-003dde15ff83");
        assert_eq!(path, Some(PathBuf::from("/dev/mapper/vg0-Rootb")));

        // near-miss uuid
        assert_eq!(
            path_from_pair_output(PAIR_OUTPUT, "e4376f24-55e9-4980-8d2e-003dde15ff831"),
            None
        );
        assert_eq!(path_from_pair_output(PAIR_OUTPUT, ""), None);
    }

    const JSON_OUTPUT: &str = r#"
{
   "blockdevices": [
      {"uuid":null, "mountpoint":null, "label":null},
      {"uuid":"95EF-33CC", "mountpoint":"/boot/efi", "label":"EFI"},
      {"uuid":"47b1b22f-fe7d-40f6-99ec-5f2e32fbf143", "mountpoint":"/boot", "label":"Boot"},
      {"uuid":"017415e7-15b1-4812-beaf-8fb75e685f01", "mountpoint":"/", "label":"Roota"},
      {"uuid":"8bafe9c6-71f5-4b5c-8923-accb280cc12b", "mountpoint":"/media/del1/Rootb", "label":"Rootb"},
      {"uuid":"150f05ea-629b-4f16-acde-1bf18ac776c9", "mountpoint":"/data", "label":"_dde_data"},
      {"uuid":"1dee4cfe-7467-4c10-832f-5dfc45c35303", "mountpoint":"/recovery", "label":"Backup"},
      {"uuid":"791cde56-65a9-463b-a8ad-b5c61d9d993e", "mountpoint":"[SWAP]", "label":"SWAP"}
   ]
}
"#;

    #[test]
    fn json_records() {
        let devices = parse_json_devices(JSON_OUTPUT).unwrap();
        assert_eq!(devices.len(), 8);
        assert_eq!(devices[1].uuid.as_deref(), Some("95EF-33CC"));
        assert_eq!(devices[7].label.as_deref(), Some("SWAP"));
        assert!(devices[0].uuid.is_none());
    }

    #[test]
    fn label_map_prefers_first_match() {
        let devices = parse_json_devices(JSON_OUTPUT).unwrap();
        let map = to_label_uuid_map(&devices);
        assert_eq!(map.get("efi").map(String::as_str), Some("95EF-33CC"));
        assert_eq!(
            map.get("boot").map(String::as_str),
            Some("47b1b22f-fe7d-40f6-99ec-5f2e32fbf143")
        );
        assert_eq!(
            map.get("recovery").map(String::as_str),
            Some("1dee4cfe-7467-4c10-832f-5dfc45c35303")
        );
        assert!(!map.contains_key("rootb"));
    }

    #[test]
    fn label_match_is_case_insensitive() {
        let devices = parse_json_devices(JSON_OUTPUT).unwrap();
        let rootb = devices.iter().find(|d| d.label_matches("rootb")).unwrap();
        assert_eq!(rootb.uuid.as_deref(), Some("8bafe9c6-71f5-4b5c-8923-accb280cc12b"));
    }
}
