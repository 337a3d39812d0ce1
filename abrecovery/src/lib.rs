// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A/B root partition recovery core
//!
//! Two root filesystems coexist: the one the system is running from and a
//! backup copy. [`backup`] replicates the live root onto the backup
//! partition and registers a bootloader menu entry for it; [`restore`]
//! promotes the backup to live and retires the old root. [`Manager`]
//! enforces the at-most-one-job rule around both.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod bootloader;
pub mod config;
pub mod extras;
pub mod hiding;
pub mod kernel;
pub mod manager;
pub mod mount;
pub mod osinfo;
pub mod util;

mod backup;
mod restore;

pub use backup::{backup, fix_backup};
pub use config::RoleConfig;
pub use kernel::KernelFiles;
pub use manager::{JobEnd, JobKind, Manager};
pub use restore::restore;

/// Persistent role configuration
pub const CONFIG_FILE: &str = "/etc/deepin/ab-recovery.json";

/// Where the backup partition is mounted during a backup run
pub const BACKUP_MOUNT_POINT: &str = "/deepin-ab-recovery-backup";

/// Zero byte marker at the root of any backup-role partition
pub const BACKUP_PARTITION_MARK_FILE: &str = ".deepin-ab-recovery-backup";

/// Kernels of the retired root are parked here during a restore
pub const KERNEL_PARK_DIR: &str = "/boot/kernel-backup/";

/// Recovery helper binary shipped on both roots
pub const RECOVERY_HELPER_FILE: &str = "/usr/lib/deepin-daemon/ab-recovery";

/// Session greeter binary which must not run on the backup root
pub const DDE_WELCOME_FILE: &str = "/usr/lib/deepin-daemon/dde-welcome";

/// Core error type for abrecovery
#[derive(Debug, Error)]
pub enum Error {
    #[error("block device query: {0}")]
    Blockdev(#[from] blockdev::Error),

    #[error("boot config: {0}")]
    Bootloader(#[from] bootloader::Error),

    #[error("no kernel image found for release {0:?}")]
    KernelNotFound(String),

    #[error("failed to mount {0}: {1}")]
    Mount(PathBuf, String),

    #[error("failed to unmount {0}: {1}")]
    Unmount(PathBuf, String),

    #[error("replication failed: {stderr}")]
    Replication { stderr: String },

    #[error("fstab has no root entry to rewrite")]
    NoFstabTarget,

    #[error("another job is already running")]
    Busy,

    #[error("operation is not permitted in the current state")]
    GateDenied,

    #[error("generic i/o error: {0}")]
    IO(#[from] std::io::Error),

    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process-wide runtime facts, established once at startup.
///
/// Collects the architecture gates and tunable paths so the operations
/// take one immutable context instead of consulting globals.
#[derive(Debug)]
pub struct RuntimeContext {
    /// Machine architecture, `uname -m` unless overridden
    pub arch: String,

    /// Directory holding kernel images, normally `/boot`
    pub boot_dir: PathBuf,

    /// Where backed up kernels live, `<boot_dir>/deepin-ab-recovery`
    pub kernel_backup_dir: PathBuf,

    /// GRUB menu file, edited directly on arches without grub-mkconfig
    pub grub_cfg_file: PathBuf,

    /// PMON menu file for loongson boards with the read-only firmware
    pub pmon_cfg_file: PathBuf,

    /// Firmware is the PMON variant (no backups possible)
    pub use_pmon_bios: bool,

    /// No bootloader regeneration tool on this arch
    pub no_grub_mkconfig: bool,

    /// Menu text must not be localized
    pub menu_text_en: bool,

    /// Skip the replication run (testing aid)
    pub skip_replication: bool,
}

/// Startup overrides for [`RuntimeContext::detect`]
#[derive(Debug, Default)]
pub struct ContextOverrides {
    pub arch: Option<String>,
    pub boot_dir: Option<PathBuf>,
    pub grub_cfg_file: Option<PathBuf>,
    pub no_grub_mkconfig: bool,
    pub menu_text_en: bool,
    pub skip_replication: bool,
}

impl RuntimeContext {
    /// Establish the runtime context from the running machine plus overrides
    pub fn detect(overrides: ContextOverrides) -> Result<Self, Error> {
        let uts = util::uname()?;
        let arch = overrides.arch.unwrap_or(uts.machine);

        let mut use_pmon_bios = false;
        if arch.starts_with("mips") {
            match osinfo::read_board_info() {
                Ok(board) => use_pmon_bios = board.bios_version.contains("PMON"),
                Err(e) => log::warn!("failed to read board info: {e}"),
            }
        }

        let mut no_grub_mkconfig = overrides.no_grub_mkconfig;
        if arch == "sw_64" {
            no_grub_mkconfig = true;
        }

        let menu_text_en =
            overrides.menu_text_en || arch.starts_with("mips") || arch.starts_with("arm");

        let boot_dir = util::clean_path(&overrides.boot_dir.unwrap_or_else(|| PathBuf::from("/boot")));
        let kernel_backup_dir = boot_dir.join("deepin-ab-recovery");

        Ok(Self {
            arch,
            boot_dir,
            kernel_backup_dir,
            grub_cfg_file: overrides
                .grub_cfg_file
                .unwrap_or_else(|| PathBuf::from("/boot/grub/grub.cfg")),
            pmon_cfg_file: PathBuf::from("/boot/boot/boot.cfg"),
            use_pmon_bios,
            no_grub_mkconfig,
            menu_text_en,
            skip_replication: overrides.skip_replication,
        })
    }

    pub fn is_arch_mips(&self) -> bool {
        self.arch.starts_with("mips")
    }

    pub fn is_arch_arm(&self) -> bool {
        self.arch.starts_with("arm")
    }

    pub fn is_arch_sunway(&self) -> bool {
        self.arch == "sw_64"
    }

    /// The kernel backup dir relative to the boot dir, as used in GRUB
    /// entries (`deepin-ab-recovery/<image>`)
    pub fn kernel_backup_rel(&self) -> PathBuf {
        self.kernel_backup_dir
            .strip_prefix(&self.boot_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.kernel_backup_dir.clone())
    }
}
