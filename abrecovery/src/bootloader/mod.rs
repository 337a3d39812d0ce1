// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader configuration writing
//!
//! Three write modes exist. Systems with a working `grub-mkconfig` get a
//! shell fragment under `/etc/default/grub.d/` plus a regeneration run;
//! MIPS and Sunway systems have no regeneration tool, so their `grub.cfg`
//! is edited in place; PMON firmware uses its own flat menu file.

use std::{
    fs,
    io::{self, Write},
    path::Path,
    process::Command,
};

use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::{KernelFiles, RuntimeContext};

pub mod grub;
pub mod pmon;

pub use grub::GrubConfig;
pub use pmon::PmonConfig;

/// Fragment consumed by grub-mkconfig, describes the recovery entry
pub const GRUB_FRAGMENT_FILE: &str = "/etc/default/grub.d/11_deepin_ab_recovery.cfg";

/// Companion fragment that sources the hide-os helper output
pub const GRUB_FRAGMENT_12_FILE: &str = "/etc/default/grub.d/12_deepin_ab_recovery.cfg";

const MSG_ROLL_BACK: &str = "Roll back to %s (%s)";
const VAR_PREFIX: &str = "DEEPIN_AB_RECOVERY_";

/// Boot config layer errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed boot config: {0}")]
    MalformedConfig(String),

    #[error("no root uuid replacement target")]
    NoReplaceTarget,

    #[error("bootloader regeneration failed: {0}")]
    Regeneration(String),

    #[error("from io: {0}")]
    IO(#[from] io::Error),
}

pub(crate) static ROOT_UUID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"root=UUID=[0-9a-fA-F\-]+").unwrap());

/// Rewrite any `root=UUID=…` token in `line` to point at `uuid`
pub(crate) fn replace_root_uuid_in(line: &str, uuid: &str) -> String {
    ROOT_UUID
        .replace_all(line, format!("root=UUID={uuid}"))
        .into_owned()
}

/// Write `data` to `path` through a rename, with mode 0644
pub(crate) fn save_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or(Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))?;
    file.persist(path).map_err(|e| Error::IO(e.error))?;
    Ok(())
}

/// Localized rollback menu text, falling back to English when the
/// message catalog cannot be consulted
pub fn rollback_menu_text(os_desc: &str, time: DateTime<Utc>, env_vars: &[(String, String)]) -> String {
    match localized_menu_text(os_desc, time, env_vars) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("{e}");
            rollback_menu_text_en(os_desc, time)
        }
    }
}

fn localized_menu_text(
    os_desc: &str,
    time: DateTime<Utc>,
    env_vars: &[(String, String)],
) -> Result<String, Error> {
    let output = Command::new("gettext")
        .arg("-d")
        .arg("deepin-ab-recovery")
        .arg(MSG_ROLL_BACK)
        .envs(env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .output()?;
    if !output.status.success() {
        return Err(Error::IO(io::Error::other(format!(
            "gettext exited with {}",
            output.status
        ))));
    }
    let template = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let date = time.with_timezone(&Local).format("%Y/%-m/%-d %T").to_string();
    Ok(fill_template(&template, os_desc, &date))
}

/// English rollback menu text, for arches without localized menus
pub fn rollback_menu_text_en(os_desc: &str, time: DateTime<Utc>) -> String {
    let date = time
        .with_timezone(&Local)
        .format("%a %d %b %Y %I:%M:%S %p %Z")
        .to_string();
    fill_template(MSG_ROLL_BACK, os_desc, &date)
}

fn fill_template(template: &str, os_desc: &str, date: &str) -> String {
    template.replacen("%s", os_desc, 1).replacen("%s", date, 1)
}

/// Run the bootloader regeneration tool, preferring `update-grub`
pub fn run_update_grub(ctx: &RuntimeContext, env_vars: &[(String, String)]) -> Result<(), Error> {
    if ctx.no_grub_mkconfig {
        return Ok(());
    }

    let env = env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str()));
    let status = match Command::new("update-grub").envs(env.clone()).status() {
        Ok(status) => status,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!("not found command update-grub");
            log::debug!("$ grub-mkconfig -o /boot/grub/grub.cfg");
            Command::new("grub-mkconfig")
                .arg("-o")
                .arg("/boot/grub/grub.cfg")
                .envs(env)
                .status()?
        }
        Err(e) => return Err(e.into()),
    };
    if !status.success() {
        return Err(Error::Regeneration(format!(
            "grub regeneration exited with {status}"
        )));
    }
    Ok(())
}

/// Shell fragment registering the backup kernel with grub-mkconfig
fn backup_fragment(
    ctx: &RuntimeContext,
    backup_uuid: &str,
    backup_device: &Path,
    os_desc: &str,
    kernel_files: &KernelFiles,
    time: DateTime<Utc>,
) -> String {
    let device = backup_device.display();
    let linux = ctx
        .kernel_backup_dir
        .join(kernel_files.linux.file_name().unwrap_or_default());

    let mut out = String::new();
    out.push_str(&format!("{VAR_PREFIX}BACKUP_DEVICE={device}\n"));
    out.push_str(&format!("{VAR_PREFIX}BACKUP_UUID={backup_uuid}\n"));
    out.push_str(&format!(
        "GRUB_OS_PROBER_SKIP_LIST=\"$GRUB_OS_PROBER_SKIP_LIST {backup_uuid}@{device}\"\n"
    ));
    out.push_str(&format!("{VAR_PREFIX}LINUX=\"{}\"\n", linux.display()));
    if let Some(initrd) = &kernel_files.initrd {
        out.push_str(&format!(
            "{VAR_PREFIX}INITRD=\"{}\"\n",
            initrd.file_name().unwrap_or_default().to_string_lossy()
        ));
    }
    out.push_str(&format!("{VAR_PREFIX}OS_DESC=\"{os_desc}\"\n"));
    out.push_str(&format!("{VAR_PREFIX}BACKUP_TIME={}\n", time.timestamp()));
    out
}

fn write_fragment(content: &str) -> Result<(), Error> {
    let path = Path::new(GRUB_FRAGMENT_FILE);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Kernel paths relative to the boot directory, for in-place GRUB edits
fn grub_relative_paths(ctx: &RuntimeContext, kernel_files: &KernelFiles) -> (String, String) {
    let dir = ctx.kernel_backup_rel();
    let linux = dir
        .join(kernel_files.linux.file_name().unwrap_or_default())
        .to_string_lossy()
        .into_owned();
    let initrd = match &kernel_files.initrd {
        Some(initrd) => dir
            .join(initrd.file_name().unwrap_or_default())
            .to_string_lossy()
            .into_owned(),
        None => dir.to_string_lossy().into_owned(),
    };
    (linux, initrd)
}

/// Kernel paths for the PMON menu. The boot dir is stripped without its
/// trailing slash, keeping the leading `/` the firmware expects.
fn pmon_relative_paths(ctx: &RuntimeContext, kernel_files: &KernelFiles) -> (String, String) {
    let dir = {
        let full = ctx.kernel_backup_dir.to_string_lossy().into_owned();
        let boot = ctx.boot_dir.to_string_lossy().into_owned();
        full.strip_prefix(&boot).map(str::to_string).unwrap_or(full)
    };
    let linux = format!(
        "{dir}/{}",
        kernel_files.linux.file_name().unwrap_or_default().to_string_lossy()
    );
    let initrd = match &kernel_files.initrd {
        Some(initrd) => format!("{dir}/{}", initrd.file_name().unwrap_or_default().to_string_lossy()),
        None => dir,
    };
    (linux, initrd)
}

/// Register the freshly written backup with the bootloader (§ backup)
pub fn write_backup_config(
    ctx: &RuntimeContext,
    backup_uuid: &str,
    backup_device: &Path,
    os_desc: &str,
    kernel_files: &KernelFiles,
    time: DateTime<Utc>,
    env_vars: &[(String, String)],
) -> Result<(), Error> {
    let english_env = [
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("LANGUAGE".to_string(), "en_US".to_string()),
    ];
    let env_vars: &[(String, String)] = if ctx.menu_text_en { &english_env } else { env_vars };

    if ctx.use_pmon_bios {
        let mut cfg = PmonConfig::parse_file(&ctx.pmon_cfg_file)?;
        cfg.remove_recovery_entries();
        let menu_text = rollback_menu_text_en(os_desc, time);
        let (linux, initrd) = pmon_relative_paths(ctx, kernel_files);
        cfg.add_recovery_entry(&menu_text, backup_uuid, &linux, &initrd);
        return cfg.save(&ctx.pmon_cfg_file);
    }

    if ctx.no_grub_mkconfig {
        if !ctx.is_arch_sunway() && !ctx.is_arch_mips() {
            return Ok(());
        }
        let mut cfg = GrubConfig::parse_file(&ctx.grub_cfg_file)?;
        cfg.remove_recovery_entries();
        let (linux, initrd) = grub_relative_paths(ctx, kernel_files);
        if ctx.is_arch_sunway() {
            let menu_text = rollback_menu_text(os_desc, time, env_vars);
            cfg.add_recovery_entry_sunway(&menu_text, backup_uuid, &linux, &initrd);
        } else {
            let menu_text = rollback_menu_text_en(os_desc, time);
            cfg.add_recovery_entry_mips(&menu_text, backup_uuid, &linux, &initrd);
        }
        return cfg.save(&ctx.grub_cfg_file);
    }

    write_fragment(&backup_fragment(
        ctx,
        backup_uuid,
        backup_device,
        os_desc,
        kernel_files,
        time,
    ))?;
    run_update_grub(ctx, env_vars)
}

/// Rewrite the bootloader for the restored root (§ restore)
pub fn write_restore_config(
    ctx: &RuntimeContext,
    current_uuid: &str,
    current_device: &Path,
    backup_uuid: &str,
    env_vars: &[(String, String)],
) -> Result<(), Error> {
    if ctx.use_pmon_bios {
        let mut cfg = PmonConfig::parse_file(&ctx.pmon_cfg_file)?;
        cfg.remove_recovery_entries();
        cfg.replace_root_uuid(backup_uuid)?;
        return cfg.save(&ctx.pmon_cfg_file);
    }

    if ctx.no_grub_mkconfig {
        if !ctx.is_arch_sunway() && !ctx.is_arch_mips() {
            return Ok(());
        }
        let mut cfg = GrubConfig::parse_file(&ctx.grub_cfg_file)?;
        cfg.remove_recovery_entries();
        cfg.replace_root_uuid(backup_uuid)?;
        return cfg.save(&ctx.grub_cfg_file);
    }

    let content = format!(
        "GRUB_OS_PROBER_SKIP_LIST=\"$GRUB_OS_PROBER_SKIP_LIST {current_uuid}@{}\"\n",
        current_device.display()
    );
    write_fragment(&content)?;
    run_update_grub(ctx, env_vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_context() -> RuntimeContext {
        RuntimeContext {
            arch: "x86_64".to_string(),
            boot_dir: PathBuf::from("/boot"),
            kernel_backup_dir: PathBuf::from("/boot/deepin-ab-recovery"),
            grub_cfg_file: PathBuf::from("/boot/grub/grub.cfg"),
            pmon_cfg_file: PathBuf::from("/boot/boot/boot.cfg"),
            use_pmon_bios: false,
            no_grub_mkconfig: false,
            menu_text_en: false,
            skip_replication: false,
        }
    }

    fn kernel_files(initrd: bool) -> KernelFiles {
        KernelFiles {
            linux: PathBuf::from("/boot/vmlinuz-4.19.0-6-amd64"),
            initrd: initrd.then(|| PathBuf::from("/boot/initrd.img-4.19.0-6-amd64")),
        }
    }

    #[test]
    fn uuid_replacement_token() {
        assert_eq!(
            replace_root_uuid_in(
                "linux /vmlinuz root=UUID=14cbf2c4-9982-4f9e-be1e-71a2b3d35e19 ro quiet",
                "a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea"
            ),
            "linux /vmlinuz root=UUID=a13e2b9d-572f-4a25-ab8f-b2eda8c3f8ea ro quiet"
        );
        // lines without the token pass through
        assert_eq!(replace_root_uuid_in("initrd /initrd.img", "u"), "initrd /initrd.img");
    }

    #[test]
    fn fragment_contents() {
        let time = DateTime::from_timestamp(1622610982, 0).unwrap();
        let text = backup_fragment(
            &test_context(),
            "c180eb18-96df-47b3-9570-033528d34c3f",
            Path::new("/dev/sda3"),
            "UnionTech OS 20 Professional",
            &kernel_files(true),
            time,
        );
        assert_eq!(
            text,
            "DEEPIN_AB_RECOVERY_BACKUP_DEVICE=/dev/sda3\n\
             DEEPIN_AB_RECOVERY_BACKUP_UUID=c180eb18-96df-47b3-9570-033528d34c3f\n\
             GRUB_OS_PROBER_SKIP_LIST=\"$GRUB_OS_PROBER_SKIP_LIST c180eb18-96df-47b3-9570-033528d34c3f@/dev/sda3\"\n\
             DEEPIN_AB_RECOVERY_LINUX=\"/boot/deepin-ab-recovery/vmlinuz-4.19.0-6-amd64\"\n\
             DEEPIN_AB_RECOVERY_INITRD=\"initrd.img-4.19.0-6-amd64\"\n\
             DEEPIN_AB_RECOVERY_OS_DESC=\"UnionTech OS 20 Professional\"\n\
             DEEPIN_AB_RECOVERY_BACKUP_TIME=1622610982\n"
        );
    }

    #[test]
    fn fragment_without_initrd_omits_the_line() {
        let time = DateTime::from_timestamp(1622610982, 0).unwrap();
        let text = backup_fragment(
            &test_context(),
            "u",
            Path::new("/dev/sda3"),
            "desc",
            &kernel_files(false),
            time,
        );
        assert!(!text.contains("INITRD"));
    }

    #[test]
    fn grub_paths_are_boot_relative() {
        let (linux, initrd) = grub_relative_paths(&test_context(), &kernel_files(true));
        assert_eq!(linux, "deepin-ab-recovery/vmlinuz-4.19.0-6-amd64");
        assert_eq!(initrd, "deepin-ab-recovery/initrd.img-4.19.0-6-amd64");
    }

    #[test]
    fn pmon_paths_keep_the_leading_slash() {
        let (linux, initrd) = pmon_relative_paths(&test_context(), &kernel_files(true));
        assert_eq!(linux, "/deepin-ab-recovery/vmlinuz-4.19.0-6-amd64");
        assert_eq!(initrd, "/deepin-ab-recovery/initrd.img-4.19.0-6-amd64");
    }

    #[test]
    fn english_menu_text_shape() {
        let time = DateTime::from_timestamp(1622610982, 0).unwrap();
        let text = rollback_menu_text_en("UnionTech OS 20", time);
        assert!(text.starts_with("Roll back to UnionTech OS 20 ("));
        assert!(text.ends_with(')'));
    }

    #[test]
    fn template_fills_in_order() {
        assert_eq!(fill_template("Roll back to %s (%s)", "OS", "date"), "Roll back to OS (date)");
        assert_eq!(fill_template("回滚到 %s（%s）", "OS", "date"), "回滚到 OS（date）");
    }
}
