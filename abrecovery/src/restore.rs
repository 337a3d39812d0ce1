// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The rollback orchestration
//!
//! Promotes the backup partition to live root: the stashed kernel
//! replaces the running one, the bootloader is pointed back, preserved
//! extras are symlinked in, the roles swap, and the retired root is
//! hidden from the removable-media layer. Unlike backup this edits the
//! live root directly, nothing is mounted here.

use std::{fs, path::Path};

use crate::{
    bootloader, extras, hiding, mount, Error, RoleConfig, RuntimeContext, BACKUP_PARTITION_MARK_FILE,
    CONFIG_FILE, DDE_WELCOME_FILE, KERNEL_PARK_DIR,
};

const KERNEL_ARTIFACT_MARKS: [&str; 4] = ["vmlinuz-", "vmlinux-", "kernel-", "initrd"];

/// Boot files that belong to the soon-to-be-stale root
fn is_kernel_artifact(name: &str) -> bool {
    KERNEL_ARTIFACT_MARKS.iter().any(|mark| name.contains(mark))
}

/// Roll the system back onto the backup root
pub fn restore(ctx: &RuntimeContext, cfg: &mut RoleConfig, env_vars: &[(String, String)]) -> Result<(), Error> {
    let current_device = blockdev::device_by_uuid(&cfg.current)?;

    // undo the greeter shim installed by fix-backup
    let saved_welcome = format!("{DDE_WELCOME_FILE}.save");
    if Path::new(&saved_welcome).exists() {
        if let Err(e) = fs::rename(&saved_welcome, DDE_WELCOME_FILE) {
            log::warn!("failed to restore dde-welcome: {e}");
        }
    }

    fs::create_dir_all(KERNEL_PARK_DIR)?;
    park_stale_kernels(ctx)?;

    // bring the stashed kernel back into the boot dir
    for entry in fs::read_dir(&ctx.kernel_backup_dir)? {
        let entry = entry?;
        let dest = ctx.boot_dir.join(entry.file_name());
        if let Err(e) = fs::copy(entry.path(), &dest) {
            log::warn!("copy recovery file failed: {e}");
            return Err(e.into());
        }
    }
    if let Err(e) = fs::remove_dir_all(&ctx.kernel_backup_dir) {
        log::warn!("remove dir {} failed: {e}", ctx.kernel_backup_dir.display());
    }

    bootloader::write_restore_config(ctx, &cfg.current, &current_device, &cfg.backup, env_vars)?;

    let registry = extras::ExtraRegistry::load(
        extras::BACKUP_RECORD_PATH,
        extras::DEFAULT_HOSPICE_DIR,
        extras::default_specs(),
    );
    registry.recover_deprecated(true);
    registry.restore_phase();

    cfg.swap_roles();
    cfg.save(CONFIG_FILE)?;

    hide_retired_root(cfg);

    match fs::remove_file(Path::new("/").join(BACKUP_PARTITION_MARK_FILE)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Move the stale root's boot files aside. Per-file failures are logged,
/// a partially parked set never aborts the rollback.
fn park_stale_kernels(ctx: &RuntimeContext) -> Result<(), Error> {
    for entry in fs::read_dir(&ctx.boot_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_kernel_artifact(&name) {
            continue;
        }
        if let Err(e) = fs::rename(entry.path(), Path::new(KERNEL_PARK_DIR).join(&name)) {
            log::warn!("backup kernel failed: {name}: {e}");
        }
    }
    Ok(())
}

/// Update the udev hiding rules so the retired root (now the backup)
/// stays invisible, then unmount it. All failures here are logged only;
/// the rollback itself has already succeeded.
fn hide_retired_root(cfg: &RoleConfig) {
    let root_disk = match blockdev::disk_of_path("/") {
        Ok(disk) => disk,
        Err(e) => {
            log::warn!("failed to get root disk: {e}");
            return;
        }
    };
    let label_uuid_map = match blockdev::label_uuid_map(&root_disk) {
        Ok(map) => map,
        Err(e) => {
            log::warn!("failed to get label uuid map: {e}");
            return;
        }
    };
    let backup_device = match blockdev::device_by_uuid(&cfg.backup) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("{e}");
            return;
        }
    };
    let backup_label = match blockdev::label_of_device(&backup_device) {
        Ok(label) => label,
        Err(e) => {
            log::warn!("{e}");
            return;
        }
    };

    let mut found_rules = false;
    for rules_path in hiding::RULES_PATHS {
        if !Path::new(rules_path).exists() {
            continue;
        }
        match hiding::modify_rules_file(rules_path, &label_uuid_map, &cfg.backup, &cfg.current, &backup_label) {
            Ok(()) => found_rules = true,
            Err(e) => log::warn!("failed to modify rules: {e}"),
        }
    }
    if !found_rules {
        log::warn!("not found 80-udisks-installer.rules or 80-udisks2.rules");
        return;
    }

    if let Err(e) = hiding::reload_udev() {
        log::warn!("{e}");
        return;
    }
    match blockdev::mountpoint_by_label(backup_label.trim().to_lowercase().as_str()) {
        Ok(mount_dir) if !mount_dir.is_empty() => mount::unmount_and_remove(mount_dir),
        Ok(_) => {}
        Err(e) => log::warn!("{e}"),
    }
}
