// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The backup orchestration
//!
//! Replicates the live root onto the backup partition, captures the
//! running kernel, rewrites the copied fstab, marks the partition as a
//! backup and registers the bootloader entry. Any stage failure aborts
//! the job; the mount and the exclusion temp file are released by their
//! guards on every exit path.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    bootloader, extras, kernel, mount::ScopedMount, osinfo, util, Error, KernelFiles, RoleConfig,
    RuntimeContext, BACKUP_MOUNT_POINT, BACKUP_PARTITION_MARK_FILE, CONFIG_FILE, DDE_WELCOME_FILE,
    RECOVERY_HELPER_FILE,
};

const SKIP_DIRS: [&str; 6] = ["/media", "/tmp", "/proc", "/sys", "/dev", "/run"];

static RENAME_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"rsync: rename "([0-9a-zA-Z/+.=-]+)" -> "([0-9a-zA-Z/+.=-]+)": Operation not permitted"#)
        .unwrap()
});

static UNLINK_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rsync: delete_file: unlink\(([0-9a-zA-Z/+.=-]+)\) failed: Operation not permitted").unwrap()
});

/// Replicate the live root onto the backup partition and register it
pub fn backup(ctx: &RuntimeContext, cfg: &mut RoleConfig, env_vars: &[(String, String)]) -> Result<(), Error> {
    let backup_uuid = cfg.backup.clone();
    let backup_device = blockdev::device_by_uuid(&backup_uuid)?;
    log::debug!("backup device: {}", backup_device.display());

    let mounted = ScopedMount::mount(&backup_device, BACKUP_MOUNT_POINT)?;

    let mut exclude_items: Vec<&str> = SKIP_DIRS.to_vec();
    exclude_items.push(BACKUP_MOUNT_POINT);
    let exclude_file = util::write_exclude_file(&exclude_items)?;

    let os = osinfo::gather();
    let now = Utc::now();
    cfg.time = Some(now);
    cfg.version = os.version.clone();
    cfg.save(CONFIG_FILE)?;

    let registry = extras::ExtraRegistry::load(
        extras::BACKUP_RECORD_PATH,
        extras::DEFAULT_HOSPICE_DIR,
        extras::default_specs(),
    );
    registry.recover_deprecated(false);
    registry.save_record()?;
    registry.backup_phase();

    run_replication(ctx, exclude_file.path())?;

    for dir in SKIP_DIRS {
        let dir = util::join_under(mounted.point(), dir);
        if let Err(e) = fs::create_dir(&dir) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }
    }

    modify_fstab(
        util::join_under(mounted.point(), "etc/fstab"),
        &backup_uuid,
        &backup_device,
    )?;

    let kernel_files = backup_kernel(ctx)?;

    let mark = mounted.point().join(BACKUP_PARTITION_MARK_FILE);
    fs::write(&mark, b"")?;
    set_mode(&mark, 0o644)?;

    bootloader::write_backup_config(
        ctx,
        &backup_uuid,
        &backup_device,
        &os.description,
        &kernel_files,
        now,
        env_vars,
    )?;

    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn run_replication(ctx: &RuntimeContext, exclude_file: &Path) -> Result<(), Error> {
    if ctx.skip_replication {
        log::debug!("skip replication run");
        return Ok(());
    }

    log::debug!("run rsync...");
    let child = Command::new("rsync")
        .args(["-X", "-x", "-a", "--delete-after"])
        .arg(format!("--exclude-from={}", exclude_file.display()))
        .arg("/")
        .arg(format!("{BACKUP_MOUNT_POINT}/"))
        .env("LC_ALL", "C")
        .stderr(Stdio::piped())
        .spawn()?;
    let output = child.wait_with_output()?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    for target in immutable_hint_targets(&stderr) {
        let path = util::join_under(BACKUP_MOUNT_POINT, &target);
        if let Err(e) = Command::new("chattr").arg("-i").arg(&path).status() {
            log::warn!("chattr -i {} failed: {e}", path.display());
        }
    }
    Err(Error::Replication { stderr })
}

/// Paths inside the backup partition whose immutable attribute blocked
/// rsync. Clearing it is a hint for the next run; the replication error
/// itself still stands.
fn immutable_hint_targets(stderr: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for m in RENAME_FAILED.captures_iter(stderr) {
        let temp_name = Path::new(&m[1]).file_name().unwrap_or_default().to_string_lossy().into_owned();
        let dest = &m[2];
        let dest_name = Path::new(dest).file_name().unwrap_or_default().to_string_lossy().into_owned();
        if temp_name.contains(&dest_name) {
            targets.push(dest.to_string());
        }
    }
    for m in UNLINK_FAILED.captures_iter(stderr) {
        targets.push(m[1].to_string());
    }
    targets
}

/// Rewrite the root entry of the copied fstab to mount the backup UUID
pub fn modify_fstab(path: impl AsRef<Path>, uuid: &str, device: &Path) -> Result<(), Error> {
    let content = fs::read_to_string(path.as_ref())?;
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();

    let mut done = false;
    for idx in 0..lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "/" && fields[0].starts_with("UUID") {
            let old = fields[0].to_string();
            lines[idx] = lines[idx].replacen(&old, &format!("UUID={uuid}"), 1);
            if idx > 0 && lines[idx - 1].trim_start().starts_with('#') {
                lines[idx - 1] = format!("# {}", device.display());
            }
            done = true;
            break;
        }
    }
    if !done {
        return Err(Error::NoFstabTarget);
    }

    fs::write(path.as_ref(), lines.join("\n"))?;
    Ok(())
}

/// Stash the booted kernel under the kernel backup dir.
///
/// The previous stash is rotated to `.old` so a failure mid-copy never
/// leaves the only copy half written; the rotation is dropped once the
/// fresh copy is complete.
fn backup_kernel(ctx: &RuntimeContext) -> Result<KernelFiles, Error> {
    let old_dir = PathBuf::from(format!("{}.old", ctx.kernel_backup_dir.display()));
    remove_dir_if_exists(&old_dir)?;
    match fs::rename(&ctx.kernel_backup_dir, &old_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir(&ctx.kernel_backup_dir)?;

    let uts = util::uname()?;
    let mut release = uts.release;
    match util::read_boot_options() {
        Ok(options) => {
            if let Some(booted) = kernel::release_from_boot_options(&options) {
                release = booted;
            }
        }
        Err(e) => log::warn!("failed to read boot options: {e}"),
    }

    let kernel_files = kernel::find_kernel_files(&release, &uts.machine, &ctx.boot_dir)?;
    log::debug!("found linux: {}", kernel_files.linux.display());
    log::debug!("found initrd: {:?}", kernel_files.initrd);

    let linux_backup = ctx
        .kernel_backup_dir
        .join(kernel_files.linux.file_name().unwrap_or_default());
    fs::copy(&kernel_files.linux, &linux_backup)?;

    if let Some(initrd) = &kernel_files.initrd {
        let initrd_backup = ctx.kernel_backup_dir.join(initrd.file_name().unwrap_or_default());
        fs::copy(initrd, &initrd_backup)?;
    }

    remove_dir_if_exists(&old_dir)?;

    Ok(kernel_files)
}

fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Refresh the recovery tooling stored inside the backup partition.
///
/// Older releases shipped a backup whose embedded recovery helper and
/// grub fragment had bugs; this replaces them with the live copies and
/// shims the backup's session greeter so it cannot start on the wrong
/// root.
pub fn fix_backup() -> Result<(), Error> {
    let cfg = match RoleConfig::load(CONFIG_FILE) {
        Ok(cfg) => cfg,
        // nothing was ever backed up, nothing to fix
        Err(Error::IO(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let backup_device = blockdev::device_by_uuid(&cfg.backup)?;

    let mounted = ScopedMount::mount(&backup_device, BACKUP_MOUNT_POINT)?;

    let helper_copy = util::join_under(mounted.point(), RECOVERY_HELPER_FILE);
    match helper_copy.parent().map(Path::exists) {
        // the backup partition is still empty, leave it alone
        Some(false) | None => return Ok(()),
        Some(true) => {}
    }

    fs::copy(RECOVERY_HELPER_FILE, &helper_copy)?;
    fs::copy(
        bootloader::GRUB_FRAGMENT_12_FILE,
        util::join_under(mounted.point(), bootloader::GRUB_FRAGMENT_12_FILE),
    )?;

    let welcome_copy = util::join_under(mounted.point(), DDE_WELCOME_FILE);
    if let Ok(meta) = fs::metadata(&welcome_copy) {
        if meta.len() > 100 {
            let saved = PathBuf::from(format!("{}.save", welcome_copy.display()));
            fs::rename(&welcome_copy, saved)?;
            fs::write(&welcome_copy, b"#!/bin/sh\nexec /usr/bin/true")?;
            set_mode(&welcome_copy, 0o755)?;
        }
    }

    Ok(())
}
