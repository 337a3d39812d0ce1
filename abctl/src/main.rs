// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Command line front end for the A/B recovery core.
//!
//! Drives backup and rollback manually, reports the controller state,
//! and implements the grub.d helper mode that prints the os-prober skip
//! list for the backup partition.

use std::{
    env,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
};

use abrecovery::{
    mount::ScopedMount, ContextOverrides, Manager, RuntimeContext, BACKUP_PARTITION_MARK_FILE,
};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use pretty_env_logger::formatted_builder;

/// A/B root partition backup and rollback
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Override the machine architecture (defaults to uname -m)
    #[arg(long, global = true)]
    arch: Option<String>,

    /// Override the boot directory
    #[arg(long, global = true)]
    boot: Option<PathBuf>,

    /// Override the GRUB menu file edited on arches without grub-mkconfig
    #[arg(long = "grub-cfg", global = true)]
    grub_cfg: Option<PathBuf>,

    /// Do not run the bootloader regeneration tool
    #[arg(long, global = true)]
    no_grub_mkconfig: bool,

    /// Always write English menu text
    #[arg(long = "grub-menu-en", global = true)]
    grub_menu_en: bool,

    /// Skip the replication run (testing aid)
    #[arg(long = "no-rsync", global = true)]
    no_rsync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report controller state and gate results
    Status,

    /// Replicate the live root onto the backup partition
    Backup,

    /// Roll back onto the backup partition
    Restore,

    /// Refresh the recovery tooling stored inside the backup partition
    FixBackup,

    /// Print the GRUB_OS_PROBER_SKIP_LIST line for the backup partition
    PrintShHideOs,
}

fn main() -> color_eyre::Result<()> {
    // subprocesses must resolve through the administrative paths only
    env::set_var("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");

    color_eyre::install()?;
    formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let ctx = RuntimeContext::detect(ContextOverrides {
        arch: cli.arch,
        boot_dir: cli.boot,
        grub_cfg_file: cli.grub_cfg,
        no_grub_mkconfig: cli.no_grub_mkconfig,
        menu_text_en: cli.grub_menu_en,
        skip_replication: cli.no_rsync,
    })
    .wrap_err("failed to establish runtime context")?;
    log::debug!("runtime context: {ctx:?}");

    match cli.command {
        Commands::Status => status(ctx),
        Commands::Backup => run_job(ctx, abrecovery::JobKind::Backup),
        Commands::Restore => run_job(ctx, abrecovery::JobKind::Restore),
        Commands::FixBackup => {
            check_permissions()?;
            abrecovery::fix_backup().wrap_err("failed to fix backup")
        }
        Commands::PrintShHideOs => {
            // the helper's stdout is sourced by grub.d, keep it clean
            std::process::exit(print_sh_hide_os());
        }
    }
}

/// Bail-out permission check for execution
fn check_permissions() -> color_eyre::Result<()> {
    let euid = unsafe { nix::libc::geteuid() };
    match euid {
        0 => Ok(()),
        _ => Err(eyre!("abctl must be run with root privileges to work correctly")),
    }
}

/// LANG/LANGUAGE of the caller, propagated into the regeneration tool
fn locale_env_vars() -> Vec<(String, String)> {
    ["LANG", "LANGUAGE"]
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

fn status(ctx: RuntimeContext) -> color_eyre::Result<()> {
    let manager = Manager::new(Arc::new(ctx), Box::new(|_| {}));
    let status = manager.status();

    println!("config valid: {}", status.config_valid);
    println!("backing up:   {}", status.backing_up);
    println!("restoring:    {}", status.restoring);
    if !status.backup_version.is_empty() {
        println!("last backup:  version {}", status.backup_version);
    }
    if let Some(time) = status.backup_time {
        println!("backup time:  {time}");
    }
    match manager.can_backup() {
        Ok(can) => println!("can backup:   {can}"),
        Err(e) => println!("can backup:   unknown ({e})"),
    }
    match manager.can_restore() {
        Ok(can) => println!("can restore:  {can}"),
        Err(e) => println!("can restore:  unknown ({e})"),
    }
    Ok(())
}

fn run_job(ctx: RuntimeContext, kind: abrecovery::JobKind) -> color_eyre::Result<()> {
    check_permissions()?;

    let (tx, rx) = mpsc::channel();
    let manager = Manager::new(
        Arc::new(ctx),
        Box::new(move |end| {
            let _ = tx.send(end.clone());
        }),
    );

    let env_vars = locale_env_vars();
    match kind {
        abrecovery::JobKind::Backup => manager.start_backup(env_vars)?,
        abrecovery::JobKind::Restore => manager.start_restore(env_vars)?,
    }

    let end = rx.recv().wrap_err("job ended without a completion report")?;
    if end.success {
        log::info!("{} finished", end.kind);
        Ok(())
    } else {
        Err(eyre!("{} failed: {}", end.kind, end.message))
    }
}

const PROBE_MOUNT_DIR: &str = "/deepin-ab-recovery-isBackupDevice";

/// Whether `device` carries the backup partition marker
fn is_backup_device(device: &Path) -> Result<bool, abrecovery::Error> {
    let mounted = ScopedMount::mount(device, PROBE_MOUNT_DIR)?;
    Ok(mounted.point().join(BACKUP_PARTITION_MARK_FILE).exists())
}

fn skip_list_line(uuid: &str, device: &Path) -> String {
    format!(
        "GRUB_OS_PROBER_SKIP_LIST=\"$GRUB_OS_PROBER_SKIP_LIST {uuid}@{}\"",
        device.display()
    )
}

/// Print the skip-list directive for the detected backup device, or for
/// the rootb-labelled partition as a fallback. Exit codes 1-6 name the
/// failure modes for the calling script.
fn print_sh_hide_os() -> i32 {
    let devices = match blockdev::probe_foreign_os_roots() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("run os-prober error: {e}");
            return 1;
        }
    };

    for device in devices {
        match is_backup_device(&device) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                log::warn!("is_backup_device error: {e}");
                continue;
            }
        }
        match blockdev::uuid_of_device(&device) {
            Ok(uuid) => {
                println!("{}", skip_list_line(&uuid, &device));
                return 0;
            }
            Err(e) => {
                log::warn!("get device uuid failed: {e}");
                return 2;
            }
        }
    }

    // no marked partition found, assume the rootb partition is the backup
    let uuid = match blockdev::uuid_by_label("rootb") {
        Ok(uuid) => uuid,
        Err(e) => {
            log::warn!("get rootb uuid error: {e}");
            return 3;
        }
    };
    let mountpoint = match blockdev::mountpoint_by_label("rootb") {
        Ok(mountpoint) => mountpoint,
        Err(e) => {
            log::warn!("get rootb mountPoint error: {e}");
            return 4;
        }
    };
    if mountpoint.trim() == "/" {
        log::warn!("cannot use rootb as a backup partition");
        return 5;
    }
    let device = match blockdev::device_by_uuid(&uuid) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("get backup device by backup uuid error: {e}");
            return 6;
        }
    };
    println!("{}", skip_list_line(&uuid, &device));
    0
}
