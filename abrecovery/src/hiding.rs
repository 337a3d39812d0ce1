// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! udev hiding rules for the backup partition
//!
//! The removable-media daemon must not surface the backup root as a
//! mountable volume. The rules file pairs a `# hide <label>` comment with
//! a UUID-ignore directive; after a restore the pair describing the old
//! backup partition is rewritten to hide the new one.

use std::{collections::HashMap, fs, path::Path, process::Command};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::Error;

/// Candidate rules files, not every image ships both
pub const RULES_PATHS: [&str; 2] = [
    "/etc/udev/rules.d/80-udisks2.rules",
    "/etc/udev/rules.d/80-udisks-installer.rules",
];

const BACKUP_PARTITION_COMMENT: &str = "ab-recovery backup partition";

static UUID_IGNORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"ENV\{ID_FS_UUID\}=="([^"]+)".*ENV\{UDISKS_IGNORE\}="1""#).unwrap());

/// The label named by a `# hide <label>` comment, empty when the line is
/// not such a comment
pub fn hide_target(line: &str) -> &str {
    match line.split_once("hide") {
        Some((head, tail)) if head.contains('#') => tail.trim(),
        _ => "",
    }
}

pub fn is_uuid_ignore(line: &str) -> bool {
    UUID_IGNORE.is_match(line)
}

/// UUID of a UUID-ignore directive, empty when the line is none
pub fn ignored_uuid(line: &str) -> &str {
    UUID_IGNORE
        .captures(line)
        .and_then(|m| m.get(1))
        .map(|m| m.as_str())
        .unwrap_or("")
}

fn uuid_ignore_line(uuid: &str) -> String {
    format!(r#"ENV{{ID_FS_UUID}}=="{uuid}", ENV{{UDISKS_IGNORE}}="1""#)
}

/// Rewrite the rules lines so that `new_uuid` (labelled `new_label`)
/// becomes the hidden partition in place of `old_uuid`.
///
/// An earlier bug could leave the first pair hiding efi/boot instead of
/// the backup partition; when detected, that directive is repaired from
/// the label → uuid map first. If no pair matches `old_uuid`, pairs
/// labelled roota/rootb are rewritten as a fallback.
pub fn rewrite_rules_lines(
    lines: Vec<String>,
    label_uuid_map: &HashMap<String, String>,
    new_uuid: &str,
    old_uuid: &str,
    new_label: &str,
) -> Vec<String> {
    let mut lines = lines;

    if lines.len() >= 2 {
        let target = hide_target(&lines[0]).to_string();
        if !target.is_empty() && target != BACKUP_PARTITION_COMMENT && is_uuid_ignore(&lines[1]) {
            let repaired = label_uuid_map
                .iter()
                .find(|(label, _)| target.eq_ignore_ascii_case(label))
                .map(|(_, uuid)| uuid.clone());
            if let Some(uuid) = repaired {
                lines[1] = uuid_ignore_line(&uuid);
            }
        }
    }

    // empty lines would break the pair scan
    let mut lines: Vec<String> = lines.into_iter().filter(|l| !l.trim().is_empty()).collect();

    let new_label = new_label.to_lowercase();
    let mut replace_done = false;
    for i in 0..lines.len().saturating_sub(1) {
        if ignored_uuid(&lines[i + 1]) == old_uuid {
            lines[i] = format!("# hide {new_label}");
            lines[i + 1] = uuid_ignore_line(new_uuid);
            replace_done = true;
            break;
        }
    }

    if !replace_done {
        // the recorded uuid may be wrong; retry against the comments
        for i in 0..lines.len().saturating_sub(1) {
            let target = hide_target(&lines[i]);
            if target.eq_ignore_ascii_case("roota") || target.eq_ignore_ascii_case("rootb") {
                lines[i] = format!("# hide {new_label}");
                lines[i + 1] = uuid_ignore_line(new_uuid);
            }
        }
    }

    lines
}

/// Rewrite one rules file in place, atomically (write `.new` then rename)
pub fn modify_rules_file(
    path: impl AsRef<Path>,
    label_uuid_map: &HashMap<String, String>,
    new_uuid: &str,
    old_uuid: &str,
    new_label: &str,
) -> Result<(), Error> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    let lines: Vec<String> = data.split('\n').map(str::to_string).collect();
    let lines = rewrite_rules_lines(lines, label_uuid_map, new_uuid, old_uuid, new_label);

    let mut out = String::new();
    for line in &lines {
        out.push_str(line);
        out.push('\n');
    }

    let staged = path.with_extension("rules.new");
    fs::write(&staged, out)?;
    fs::rename(&staged, path)?;
    Ok(())
}

/// Make the rules change effective
pub fn reload_udev() -> Result<(), Error> {
    for args in [&["control", "--reload-rules"][..], &["trigger"][..]] {
        let status = Command::new("udevadm").args(args).status()?;
        if !status.success() {
            return Err(Error::IO(std::io::Error::other(format!(
                "udevadm {} exited with {status}",
                args.join(" ")
            ))));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_lines(text: &str) -> Vec<String> {
        text.split('\n').map(str::to_string).collect()
    }

    #[test]
    fn hide_target_variants() {
        assert_eq!(hide_target("# hide roota"), "roota");
        assert_eq!(hide_target("#hide roota"), "roota");
        assert_eq!(hide_target(" #hide roota"), "roota");
        assert_eq!(hide_target("# hide roota rootb"), "roota rootb");
        assert_eq!(hide_target("hide roota"), "");
    }

    #[test]
    fn uuid_ignore_matching() {
        assert!(is_uuid_ignore(
            r#"ENV{ID_FS_UUID}=="47b1b22f-fe7d-40f6-99ec-5f2e32fbf143", ENV{UDISKS_IGNORE}="1""#
        ));
        assert!(!is_uuid_ignore(r#"ENV{ID_FS_TYPE}=="SWAP", ENV{UDISKS_IGNORE}="1""#));
    }

    #[test]
    fn uuid_extraction() {
        assert_eq!(
            ignored_uuid(r#"ENV{ID_FS_UUID}=="47b1b22f-fe7d-40f6-99ec-5f2e32fbf143", ENV{UDISKS_IGNORE}="1""#),
            "47b1b22f-fe7d-40f6-99ec-5f2e32fbf143"
        );
        assert_eq!(
            ignored_uuid(r#"ENV{ID_FS_UUID}=="95EF-33CC", ENV{UDISKS_IGNORE}="1""#),
            "95EF-33CC"
        );
        assert_eq!(ignored_uuid(r#"ENV{ID_FS_TYPE}=="SWAP", ENV{UDISKS_IGNORE}="1""#), "");
    }

    fn label_map() -> HashMap<String, String> {
        [
            ("efi", "95EF-33CC"),
            ("boot", "47b1b22f-fe7d-40f6-99ec-5f2e32fbf143"),
            ("roota", "017415e7-15b1-4812-beaf-8fb75e685f01"),
            ("rootb", "8bafe9c6-71f5-4b5c-8923-accb280cc12b"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn rewrites_pair_matching_old_uuid() {
        let lines = to_lines(
            r#"# hide efi
ENV{ID_FS_UUID}=="95EF-33CC", ENV{UDISKS_IGNORE}="1"
# hide boot
ENV{ID_FS_UUID}=="47b1b22f-fe7d-40f6-99ec-5f2e32fbf143", ENV{UDISKS_IGNORE}="1"
# hide rootb
ENV{ID_FS_UUID}=="8bafe9c6-71f5-4b5c-8923-accb280cc12b", ENV{UDISKS_IGNORE}="1"
# hide recovery
ENV{ID_FS_UUID}=="1dee4cfe-7467-4c10-832f-5dfc45c35303", ENV{UDISKS_IGNORE}="1"
"#,
        );
        let result = rewrite_rules_lines(
            lines,
            &label_map(),
            "017415e7-15b1-4812-beaf-8fb75e685f01",
            "8bafe9c6-71f5-4b5c-8923-accb280cc12b",
            "Roota",
        );
        assert_eq!(
            result,
            to_lines(
                r#"# hide efi
ENV{ID_FS_UUID}=="95EF-33CC", ENV{UDISKS_IGNORE}="1"
# hide boot
ENV{ID_FS_UUID}=="47b1b22f-fe7d-40f6-99ec-5f2e32fbf143", ENV{UDISKS_IGNORE}="1"
# hide roota
ENV{ID_FS_UUID}=="017415e7-15b1-4812-beaf-8fb75e685f01", ENV{UDISKS_IGNORE}="1"
# hide recovery
ENV{ID_FS_UUID}=="1dee4cfe-7467-4c10-832f-5dfc45c35303", ENV{UDISKS_IGNORE}="1""#
            )
        );
    }

    #[test]
    fn repairs_misdirected_first_pair() {
        let lines = to_lines(
            r#"# hide efi
ENV{ID_FS_UUID}=="8bafe9c6-71f5-4b5c-8923-accb280cc12b", ENV{UDISKS_IGNORE}="1"
# hide rootb
ENV{ID_FS_UUID}=="0000-bogus", ENV{UDISKS_IGNORE}="1""#,
        );
        let result = rewrite_rules_lines(
            lines,
            &label_map(),
            "017415e7-15b1-4812-beaf-8fb75e685f01",
            "8bafe9c6-71f5-4b5c-8923-accb280cc12b",
            "Roota",
        );
        // the first directive is repaired to the efi uuid before the pair
        // scan, so the rootb pair is found via the comment fallback
        assert_eq!(result[1], uuid_ignore_line("95EF-33CC"));
        assert_eq!(result[2], "# hide roota");
        assert_eq!(result[3], uuid_ignore_line("017415e7-15b1-4812-beaf-8fb75e685f01"));
    }

    #[test]
    fn falls_back_to_root_labels() {
        let lines = to_lines(
            r#"# hide ab-recovery backup partition
ENV{ID_FS_UUID}=="mismatched-uuid", ENV{UDISKS_IGNORE}="1"
# hide rootb
ENV{ID_FS_UUID}=="another-mismatch", ENV{UDISKS_IGNORE}="1""#,
        );
        let result = rewrite_rules_lines(
            lines,
            &label_map(),
            "017415e7-15b1-4812-beaf-8fb75e685f01",
            "no-such-uuid",
            "Roota",
        );
        assert_eq!(result[2], "# hide roota");
        assert_eq!(result[3], uuid_ignore_line("017415e7-15b1-4812-beaf-8fb75e685f01"));
    }

    #[test]
    fn drops_empty_lines() {
        let lines = to_lines("# hide rootb\n\nENV{ID_FS_UUID}==\"u1\", ENV{UDISKS_IGNORE}=\"1\"\n");
        let result = rewrite_rules_lines(lines, &label_map(), "u2", "u1", "Roota");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], "# hide roota");
        assert_eq!(result[1], uuid_ignore_line("u2"));
    }
}
