// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! PMON boot menu model (flat variant)
//!
//! Loongson boards with the PMON firmware use a flat `boot.cfg`: global
//! `default`/`timeout`/`showmenu` values followed by four-line entries
//! (`title`, `kernel`, `initrd`, `args`). Kernel paths are addressed
//! through the firmware's `/dev/fs/ext2@wd0` namespace.

use std::{fs, path::Path};

use super::{replace_root_uuid_in, save_atomic, Error};

const RECOVERY_TITLE_SUFFIX: &str = " # ab-recovery";
const KERNEL_PATH_PREFIX: &str = "/dev/fs/ext2@wd0";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PmonEntry {
    pub title: String,
    pub kernel: String,
    pub initrd: String,
    pub args: String,
}

impl PmonEntry {
    pub fn is_recovery(&self) -> bool {
        self.title.ends_with(RECOVERY_TITLE_SUFFIX)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PmonConfig {
    pub default_item: i32,
    pub timeout: i32,
    pub show_menu: i32,
    pub entries: Vec<PmonEntry>,
}

fn parse_value(line: &str, keyword: &str) -> Result<i32, Error> {
    line[keyword.len()..]
        .trim()
        .parse()
        .map_err(|e| Error::MalformedConfig(format!("bad {keyword} value: {e}")))
}

impl PmonConfig {
    pub fn parse(content: &str) -> Result<Self, Error> {
        let mut cfg = PmonConfig::default();
        let mut current: Option<PmonEntry> = None;

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with("default") {
                cfg.default_item = parse_value(line, "default")?;
                continue;
            }
            if line.starts_with("timeout") {
                cfg.timeout = parse_value(line, "timeout")?;
                continue;
            }
            if line.starts_with("showmenu") {
                cfg.show_menu = parse_value(line, "showmenu")?;
                continue;
            }

            if let Some(title) = line.strip_prefix("title") {
                if let Some(entry) = current.take() {
                    cfg.entries.push(entry);
                }
                current = Some(PmonEntry {
                    title: title.trim().to_string(),
                    ..Default::default()
                });
                continue;
            }

            let Some(entry) = current.as_mut() else {
                return Err(Error::MalformedConfig(
                    "menu entries must start with title".to_string(),
                ));
            };

            if let Some(kernel) = line.strip_prefix("kernel") {
                entry.kernel = kernel.trim().to_string();
            } else if let Some(initrd) = line.strip_prefix("initrd") {
                entry.initrd = initrd.trim().to_string();
            } else if let Some(args) = line.strip_prefix("args") {
                entry.args = args.trim().to_string();
            }
        }
        if let Some(entry) = current.take() {
            cfg.entries.push(entry);
        }

        Ok(cfg)
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn remove_recovery_entries(&mut self) {
        self.entries.retain(|entry| !entry.is_recovery());
    }

    pub fn add_recovery_entry(&mut self, menu_text: &str, root_uuid: &str, linux: &str, initrd: &str) {
        self.entries.push(PmonEntry {
            title: format!("{menu_text}{RECOVERY_TITLE_SUFFIX}"),
            kernel: join_firmware_path(linux),
            initrd: join_firmware_path(initrd),
            args: format!("root=UUID={root_uuid} console=tty loglevel=0 quiet splash"),
        });
    }

    /// Point every non-recovery entry at the new root UUID
    pub fn replace_root_uuid(&mut self, uuid: &str) -> Result<(), Error> {
        let mut replaced = false;
        for entry in &mut self.entries {
            if entry.is_recovery() {
                continue;
            }
            entry.args = replace_root_uuid_in(&entry.args, uuid);
            replaced = true;
        }
        if replaced {
            Ok(())
        } else {
            Err(Error::NoReplaceTarget)
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        save_atomic(path.as_ref(), self.to_string().as_bytes())
    }
}

impl std::fmt::Display for PmonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "default {}", self.default_item)?;
        writeln!(f, "timeout {}", self.timeout)?;
        writeln!(f, "showmenu {}", self.show_menu)?;
        for entry in &self.entries {
            writeln!(
                f,
                "\ntitle {}\n        kernel {}\n        initrd {}\n        args {}",
                entry.title, entry.kernel, entry.initrd, entry.args
            )?;
        }
        Ok(())
    }
}

/// Prefix a boot-relative kernel path with the firmware namespace.
/// Accepts both leading-slash and slashless inputs.
fn join_firmware_path(rel: &str) -> String {
    format!("{KERNEL_PATH_PREFIX}/{}", rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "default 0
timeout 3
showmenu 0
title UOS 20
        kernel /dev/fs/ext2@wd0/vmlinuz
        initrd /dev/fs/ext2@wd0/initrd.img
        args console=tty root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19
";

    #[test]
    fn parse_single_entry() {
        let cfg = PmonConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.default_item, 0);
        assert_eq!(cfg.timeout, 3);
        assert_eq!(cfg.show_menu, 0);
        assert_eq!(
            cfg.entries,
            vec![PmonEntry {
                title: "UOS 20".to_string(),
                kernel: "/dev/fs/ext2@wd0/vmlinuz".to_string(),
                initrd: "/dev/fs/ext2@wd0/initrd.img".to_string(),
                args: "console=tty root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19".to_string(),
            }]
        );
    }

    #[test]
    fn field_before_title_is_malformed() {
        let err = PmonConfig::parse("default 0\nkernel /dev/fs/ext2@wd0/vmlinuz\n").unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }

    #[test]
    fn replace_root_uuid_leaves_recovery_entries() {
        let input = format!(
            "{SAMPLE}\ntitle Roll back to UOS 20 # ab-recovery\n        kernel /dev/fs/ext2@wd0/vmlinuz\n        initrd /dev/fs/ext2@wd0/initrd.img\n        args console=tty root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19\n"
        );
        let mut cfg = PmonConfig::parse(&input).unwrap();
        cfg.replace_root_uuid("a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea").unwrap();
        assert_eq!(
            cfg.entries[0].args,
            "console=tty root=UUID=a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea"
        );
        assert_eq!(
            cfg.entries[1].args,
            "console=tty root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19"
        );
    }

    #[test]
    fn replace_root_uuid_on_recovery_only_config_fails() {
        let mut cfg = PmonConfig::default();
        cfg.add_recovery_entry("Roll back", "u1", "/vmlinuz", "/initrd.img");
        assert!(matches!(cfg.replace_root_uuid("u2"), Err(Error::NoReplaceTarget)));
    }

    #[test]
    fn remove_recovery_entries_keeps_the_rest() {
        let mut cfg = PmonConfig::parse(SAMPLE).unwrap();
        cfg.add_recovery_entry(
            "Roll back to xxxxx",
            "14cbf2c4-9982-4f9e-be1e-71a2b3d35e19",
            "/vmlinuz",
            "/initrd.img",
        );
        cfg.remove_recovery_entries();
        assert_eq!(cfg.entries.len(), 1);
        assert_eq!(cfg.entries[0].title, "UOS 20");
    }

    #[test]
    fn recovery_entry_paths_and_args() {
        let mut cfg = PmonConfig::default();
        cfg.add_recovery_entry(
            "testtitle",
            "a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea",
            "/vmlinuz",
            "/initrd.img",
        );
        let entry = &cfg.entries[0];
        assert_eq!(entry.title, "testtitle # ab-recovery");
        assert_eq!(entry.kernel, "/dev/fs/ext2@wd0/vmlinuz");
        assert_eq!(entry.initrd, "/dev/fs/ext2@wd0/initrd.img");
        assert_eq!(
            entry.args,
            "root=UUID=a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea console=tty loglevel=0 quiet splash"
        );
    }

    #[test]
    fn firmware_path_accepts_both_shapes() {
        assert_eq!(
            join_firmware_path("/kernel-backup/vmlinuz"),
            "/dev/fs/ext2@wd0/kernel-backup/vmlinuz"
        );
        assert_eq!(
            join_firmware_path("kernel-backup/vmlinuz"),
            "/dev/fs/ext2@wd0/kernel-backup/vmlinuz"
        );
    }

    #[test]
    fn serialize_shape() {
        let cfg = PmonConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            cfg.to_string(),
            "default 0\ntimeout 3\nshowmenu 0\n\ntitle UOS 20\n        kernel /dev/fs/ext2@wd0/vmlinuz\n        initrd /dev/fs/ext2@wd0/initrd.img\n        args console=tty root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19\n"
        );
    }
}
