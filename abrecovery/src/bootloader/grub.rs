// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GRUB menu file model (block variant)
//!
//! Parses `grub.cfg` just deeply enough to add and remove recovery menu
//! entries on architectures where no `grub-mkconfig` exists and the menu
//! file must be edited in place. Non-entry content is carried through as
//! raw lines; whitespace inside entry bodies is preserved.

use std::{fs, path::Path};

use super::{replace_root_uuid_in, save_atomic, Error, ROOT_UUID};

const RECOVERY_CLASS_MARKER: &str = " --class ab-recovery ";

/// A single `menuentry '<text>' … { … }` block
#[derive(Debug, Clone, PartialEq)]
pub struct MenuEntry {
    head: String,
    body: Vec<String>,
}

impl MenuEntry {
    /// Recovery entries carry the marker class on their head line
    pub fn is_recovery(&self) -> bool {
        self.head.contains(RECOVERY_CLASS_MARKER)
    }
}

/// Either raw top-level content or a parsed menu entry
#[derive(Debug, Clone, PartialEq)]
pub enum GrubItem {
    Line(String),
    Entry(MenuEntry),
}

impl GrubItem {
    fn write_to(&self, out: &mut String) {
        match self {
            GrubItem::Line(value) => {
                out.push_str(value);
                out.push('\n');
            }
            GrubItem::Entry(entry) => {
                out.push_str(&entry.head);
                out.push('\n');
                for line in &entry.body {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str("}\n");
            }
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            GrubItem::Line(value) => value.len() + 1,
            GrubItem::Entry(entry) => {
                entry.head.len() + 3 + entry.body.iter().map(|l| l.len() + 1).sum::<usize>()
            }
        }
    }
}

/// An ordered GRUB menu file
#[derive(Debug, Default, PartialEq)]
pub struct GrubConfig {
    items: Vec<GrubItem>,
}

impl GrubConfig {
    pub fn parse(content: &str) -> Self {
        let mut items = Vec::new();
        let mut current: Option<MenuEntry> = None;

        for raw in content.lines() {
            let line = raw.trim();
            if line.starts_with("menuentry ") && line.ends_with('{') {
                if let Some(entry) = current.take() {
                    items.push(GrubItem::Entry(entry));
                }
                current = Some(MenuEntry {
                    head: raw.to_string(),
                    body: Vec::new(),
                });
            } else if line == "}" {
                if let Some(entry) = current.take() {
                    items.push(GrubItem::Entry(entry));
                }
            } else if let Some(entry) = current.as_mut() {
                entry.body.push(raw.to_string());
            } else {
                items.push(GrubItem::Line(raw.to_string()));
            }
        }
        if let Some(entry) = current.take() {
            items.push(GrubItem::Entry(entry));
        }

        Self { items }
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn remove_recovery_entries(&mut self) {
        self.items.retain(|item| match item {
            GrubItem::Entry(entry) => !entry.is_recovery(),
            GrubItem::Line(_) => true,
        });
    }

    /// Point the first matching non-recovery entry at a new root UUID.
    ///
    /// Only `linux*` body lines are inspected; the first line carrying a
    /// `root=UUID=` token is rewritten and the scan stops there.
    pub fn replace_root_uuid(&mut self, uuid: &str) -> Result<(), Error> {
        for item in &mut self.items {
            let GrubItem::Entry(entry) = item else { continue };
            if entry.is_recovery() || entry.head.contains("Recovery") {
                continue;
            }
            for line in &mut entry.body {
                let trimmed = line.trim_start();
                if trimmed.starts_with("linux") && ROOT_UUID.is_match(line) {
                    *line = replace_root_uuid_in(line, uuid);
                    return Ok(());
                }
            }
        }
        Err(Error::NoReplaceTarget)
    }

    /// Append the Sunway recovery recipe (staged boot via linux.vmlinux)
    pub fn add_recovery_entry_sunway(&mut self, menu_text: &str, root_uuid: &str, linux: &str, initrd: &str) {
        self.items.push(GrubItem::Entry(MenuEntry {
            head: format!("menuentry '{menu_text}' --class ab-recovery {{"),
            body: vec![
                r#"echo "装载中，请耐心等待……""#.to_string(),
                r#"set boot=(${root})/boot/"#.to_string(),
                format!("linux.boot ${{boot}}/{initrd}"),
                r#"echo "装载 boot.img 成功""#.to_string(),
                "linux.console ${boot}/bootloader.bin".to_string(),
                format!(
                    "linux.vmlinux ${{boot}}/{linux}  root=UUID={root_uuid} net.ifnames=0 loglevel=0 vga=current rd.systemd.show_status=false rd.udev.log-priority=3 quiet  video=swichfb:1280x1024-32@60"
                ),
                r#"echo "装载 vmlinux 成功""#.to_string(),
                r#"echo "开始执行……""#.to_string(),
                "boot".to_string(),
            ],
        }));
    }

    /// Append the MIPS recovery recipe
    pub fn add_recovery_entry_mips(&mut self, menu_text: &str, root_uuid: &str, linux: &str, initrd: &str) {
        self.items.push(GrubItem::Entry(MenuEntry {
            head: format!("menuentry '{menu_text}' --class ab-recovery {{"),
            body: vec![
                format!(
                    "linux ${{prefix}}/{linux} console=tty loglevel=0 quiet splash locales=zh_CN.UTF-8  root=UUID={root_uuid}"
                ),
                format!("initrd ${{prefix}}/{initrd}"),
                "boot".to_string(),
            ],
        }));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.items.iter().map(GrubItem::byte_len).sum());
        for item in &self.items {
            item.write_to(&mut out);
        }
        out.into_bytes()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        save_atomic(path.as_ref(), &self.to_bytes())
    }
}
