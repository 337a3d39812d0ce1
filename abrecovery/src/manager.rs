// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Job control around backup and restore
//!
//! At most one job runs at a time. Gates answer whether a job may start
//! at all (firmware, architecture, config validity, which root is
//! mounted); the busy flags reject concurrent starts. Completion is
//! reported through a caller-supplied handler, after which the state
//! fields are updated and the busy flag drops.

use std::{
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
};

use crate::{backup, restore, Error, RoleConfig, RuntimeContext, CONFIG_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Backup => f.write_str("backup"),
            JobKind::Restore => f.write_str("restore"),
        }
    }
}

/// Completion report of one job
#[derive(Debug, Clone)]
pub struct JobEnd {
    pub kind: JobKind,
    pub success: bool,
    pub message: String,
}

/// Snapshot of the controller state for external queriers
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub backing_up: bool,
    pub restoring: bool,
    pub config_valid: bool,
    pub backup_version: String,
    pub backup_time: Option<i64>,
}

pub type JobEndHandler = Box<dyn Fn(&JobEnd) + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct JobState {
    backing_up: bool,
    restoring: bool,
    config_valid: bool,
    cfg: RoleConfig,
}

struct Shared {
    ctx: Arc<RuntimeContext>,
    state: Mutex<JobState>,
    on_job_end: JobEndHandler,
}

/// The at-most-one-job controller
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    /// Load the role config from its well-known path and build a manager
    pub fn new(ctx: Arc<RuntimeContext>, on_job_end: JobEndHandler) -> Self {
        let cfg = match RoleConfig::load(CONFIG_FILE) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("failed to load config: {e}");
                RoleConfig::default()
            }
        };
        log::debug!("current: {}", cfg.current);
        log::debug!("backup: {}", cfg.backup);

        let config_valid = match cfg.check() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e}");
                false
            }
        };

        Self::with_config(ctx, cfg, config_valid, on_job_end)
    }

    pub fn with_config(
        ctx: Arc<RuntimeContext>,
        cfg: RoleConfig,
        config_valid: bool,
        on_job_end: JobEndHandler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                state: Mutex::new(JobState {
                    config_valid,
                    cfg,
                    ..Default::default()
                }),
                on_job_end,
            }),
        }
    }

    /// The architectures a bootloader entry can be written for
    fn arch_supported(&self) -> bool {
        let ctx = &self.shared.ctx;
        if ctx.use_pmon_bios {
            return false;
        }
        if ctx.no_grub_mkconfig && !ctx.is_arch_mips() && !ctx.is_arch_sunway() {
            return false;
        }
        true
    }

    fn can_roll(&self, expected_root: impl Fn(&RoleConfig) -> String) -> Result<bool, Error> {
        if !self.arch_supported() {
            return Ok(false);
        }
        let expected = {
            let state = self.shared.state.lock().expect("state poisoned");
            if !state.config_valid {
                return Ok(false);
            }
            expected_root(&state.cfg)
        };
        let root_uuid = blockdev::root_fs_uuid()?;
        Ok(root_uuid == expected)
    }

    /// A backup may start iff the live root is the configured current one
    pub fn can_backup(&self) -> Result<bool, Error> {
        self.can_roll(|cfg| cfg.current.clone())
    }

    /// A restore may start iff the system is running from the backup root
    pub fn can_restore(&self) -> Result<bool, Error> {
        self.can_roll(|cfg| cfg.backup.clone())
    }

    pub fn start_backup(&self, env_vars: Vec<(String, String)>) -> Result<(), Error> {
        if !self.can_backup()? {
            return Err(Error::GateDenied);
        }
        {
            let mut state = self.shared.state.lock().expect("state poisoned");
            if state.backing_up {
                // a backup is already on its way, nothing to do
                return Ok(());
            }
            if state.restoring {
                return Err(Error::Busy);
            }
            state.backing_up = true;
        }

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || shared.run(JobKind::Backup, env_vars));
        Ok(())
    }

    pub fn start_restore(&self, env_vars: Vec<(String, String)>) -> Result<(), Error> {
        if !self.can_restore()? {
            return Err(Error::GateDenied);
        }
        {
            let mut state = self.shared.state.lock().expect("state poisoned");
            if state.restoring {
                return Ok(());
            }
            if state.backing_up {
                return Err(Error::Busy);
            }
            state.restoring = true;
        }

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || shared.run(JobKind::Restore, env_vars));
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        let state = self.shared.state.lock().expect("state poisoned");
        JobStatus {
            backing_up: state.backing_up,
            restoring: state.restoring,
            config_valid: state.config_valid,
            backup_version: state.cfg.version.clone(),
            backup_time: state.cfg.time.map(|t| t.timestamp()),
        }
    }

    /// Whether the process may exit without abandoning a job
    pub fn can_quit(&self) -> bool {
        let state = self.shared.state.lock().expect("state poisoned");
        !state.backing_up && !state.restoring
    }
}

impl Shared {
    fn run(&self, kind: JobKind, env_vars: Vec<(String, String)>) {
        let why = match kind {
            JobKind::Backup => "Backing up the system",
            JobKind::Restore => "Restoring the system",
        };
        let _inhibitor = ShutdownInhibitor::acquire(why);

        let mut cfg = {
            let state = self.state.lock().expect("state poisoned");
            state.cfg.clone()
        };
        let result = match kind {
            JobKind::Backup => backup(&self.ctx, &mut cfg, &env_vars),
            JobKind::Restore => restore(&self.ctx, &mut cfg, &env_vars),
        };
        if let Err(e) = &result {
            log::warn!("{e}");
        }

        let end = JobEnd {
            kind,
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
        };
        (self.on_job_end)(&end);

        let mut state = self.state.lock().expect("state poisoned");
        if result.is_ok() {
            state.cfg = cfg;
        }
        match kind {
            JobKind::Backup => state.backing_up = false,
            JobKind::Restore => state.restoring = false,
        }
    }
}

/// Defers shutdown requests while a job runs.
///
/// Holds a `systemd-inhibit --mode=block` child for the guard's
/// lifetime; the lock is released by killing the child on drop. Failure
/// to acquire only costs the deferral, the job proceeds regardless.
struct ShutdownInhibitor {
    child: Option<Child>,
}

impl ShutdownInhibitor {
    fn acquire(why: &str) -> Self {
        let child = Command::new("systemd-inhibit")
            .args(["--what=shutdown", "--who=ab-recovery", "--mode=block"])
            .arg(format!("--why={why}"))
            .args(["sleep", "infinity"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(child) => Self { child: Some(child) },
            Err(e) => {
                log::warn!("failed to inhibit shutdown: {e}");
                Self { child: None }
            }
        }
    }
}

impl Drop for ShutdownInhibitor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::warn!("failed to release shutdown inhibitor: {e}");
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn context(use_pmon_bios: bool, no_grub_mkconfig: bool, arch: &str) -> Arc<RuntimeContext> {
        Arc::new(RuntimeContext {
            arch: arch.to_string(),
            boot_dir: PathBuf::from("/boot"),
            kernel_backup_dir: PathBuf::from("/boot/deepin-ab-recovery"),
            grub_cfg_file: PathBuf::from("/boot/grub/grub.cfg"),
            pmon_cfg_file: PathBuf::from("/boot/boot/boot.cfg"),
            use_pmon_bios,
            no_grub_mkconfig,
            menu_text_en: false,
            skip_replication: false,
        })
    }

    fn manager(ctx: Arc<RuntimeContext>, config_valid: bool) -> Manager {
        Manager::with_config(ctx, RoleConfig::default(), config_valid, Box::new(|_| {}))
    }

    #[test]
    fn pmon_bios_denies_both_gates() {
        let m = manager(context(true, false, "mips64"), true);
        assert!(!m.can_backup().unwrap());
        assert!(!m.can_restore().unwrap());
    }

    #[test]
    fn no_mkconfig_needs_an_inplace_recipe() {
        // x86 without grub-mkconfig has no way to write the entry
        let m = manager(context(false, true, "x86_64"), true);
        assert!(!m.can_backup().unwrap());
    }

    #[test]
    fn invalid_config_denies_gates() {
        let m = manager(context(false, true, "mips64"), false);
        assert!(!m.can_backup().unwrap());
        assert!(!m.can_restore().unwrap());
    }

    #[test]
    fn denied_gate_rejects_start() {
        let m = manager(context(true, false, "x86_64"), true);
        assert!(matches!(m.start_backup(Vec::new()), Err(Error::GateDenied)));
        assert!(matches!(m.start_restore(Vec::new()), Err(Error::GateDenied)));
    }

    #[test]
    fn initial_status_is_idle() {
        let m = manager(context(false, false, "x86_64"), true);
        let status = m.status();
        assert!(!status.backing_up);
        assert!(!status.restoring);
        assert!(status.config_valid);
        assert!(status.backup_time.is_none());
        assert!(m.can_quit());
    }
}
