// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Preservation of directories living outside the root partition
//!
//! Some paths under the root tree are actually served by another
//! partition (e.g. `/var/lib/systemd` on a data partition). Before
//! replication they are copied aside into the hospice; after a rollback
//! the origins are replaced by symlinks into the hospice so the restored
//! system keeps seeing the preserved content.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{util, Error};

/// Hospice root on the non-root partition
pub const DEFAULT_HOSPICE_DIR: &str = "/usr/share/deepin-ab-recovery/hospice/";

/// Persisted origin → hospice mapping, written at backup start
pub const BACKUP_RECORD_PATH: &str = "/var/lib/deepin-ab-recovery/record.json";

/// One directory (or set of files inside it) that must survive a roll
#[derive(Debug, Clone)]
pub struct ExtraDirSpec {
    /// Absolute path of the directory to preserve
    pub origin: PathBuf,

    /// Hospice subdirectory; the origin's basename when empty
    pub hospice_subdir: Option<String>,

    /// When set, only these children of `origin` are preserved
    pub files: Option<Vec<String>>,
}

impl ExtraDirSpec {
    fn hospice_child(&self) -> String {
        match &self.hospice_subdir {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .origin
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// The built-in preservation policy
pub fn default_specs() -> Vec<ExtraDirSpec> {
    vec![
        ExtraDirSpec {
            origin: PathBuf::from("/var/lib/systemd"),
            hospice_subdir: None,
            files: None,
        },
        ExtraDirSpec {
            origin: PathBuf::from("/var/uos"),
            hospice_subdir: None,
            files: Some(vec!["os-license".to_string()]),
        },
    ]
}

/// Registry of preserved directories: the mapping computed from the
/// current policy and the mapping recorded by the previous backup.
#[derive(Debug)]
pub struct ExtraRegistry {
    record_path: PathBuf,
    hospice_root: PathBuf,
    specs: Vec<ExtraDirSpec>,
    record_existed: bool,

    /// origin → hospice as recorded on disk by the last backup
    pub last: BTreeMap<String, String>,

    /// origin → hospice per the current policy
    pub current: BTreeMap<String, String>,
}

impl ExtraRegistry {
    /// Compute `current` from the policy and load `last` from the record
    /// file. A missing record file is normal on first run.
    pub fn load(record_path: impl Into<PathBuf>, hospice_root: impl Into<PathBuf>, specs: Vec<ExtraDirSpec>) -> Self {
        let record_path = record_path.into();
        let hospice_root = hospice_root.into();

        let mut current = BTreeMap::new();
        for spec in &specs {
            let child = spec.hospice_child();
            match &spec.files {
                Some(files) => {
                    for file in files {
                        current.insert(
                            spec.origin.join(file).to_string_lossy().into_owned(),
                            hospice_root.join(&child).join(file).to_string_lossy().into_owned(),
                        );
                    }
                }
                None => {
                    current.insert(
                        spec.origin.to_string_lossy().into_owned(),
                        hospice_root.join(&child).to_string_lossy().into_owned(),
                    );
                }
            }
        }

        let record_existed = record_path.exists();
        let mut last = BTreeMap::new();
        match fs::read_to_string(&record_path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => last = map,
                Err(e) => log::warn!("unmarshal {} failed: {e}", record_path.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no backup record at {}", record_path.display());
            }
            Err(e) => log::warn!("read {} failed: {e}", record_path.display()),
        }

        Self {
            record_path,
            hospice_root,
            specs,
            record_existed,
            last,
            current,
        }
    }

    /// Persist the current mapping for the next restore to consult
    pub fn save_record(&self) -> Result<(), Error> {
        if let Some(parent) = self.record_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(&self.current)?;
        fs::write(&self.record_path, data)?;
        Ok(())
    }

    /// Copy every preserved unit aside into the hospice. Idempotent; a
    /// unit whose origin already is a symlink has been migrated before.
    /// Per-unit failures are logged, they never abort the pass.
    pub fn backup_phase(&self) {
        for (origin, hospice) in &self.current {
            match util::is_symlink(origin) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("is_symlink {origin:?} failed: {e}");
                    continue;
                }
            }
            if let Some(parent) = Path::new(hospice).parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::warn!("make backup dir failed: {e}");
                    continue;
                }
            }
            if let Err(e) = remove_any(Path::new(hospice)) {
                log::warn!("remove dir failed: {e}");
                continue;
            }
            if let Err(e) = copy_preserving(Path::new(origin), Path::new(hospice)) {
                log::warn!("run cp command failed: {e}");
            }
        }
    }

    /// Replace every recorded origin with a symlink into the hospice
    pub fn restore_phase(&self) {
        for (origin, hospice) in &self.last {
            match util::is_symlink(origin) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("is_symlink {origin:?} failed: {e}");
                    continue;
                }
            }
            if !Path::new(hospice).exists() {
                log::warn!("hospice path {hospice:?} does not exist, skipping");
                continue;
            }
            if let Err(e) = remove_any(Path::new(origin)) {
                log::warn!("remove origin dir failed: {e}");
                continue;
            }
            if let Err(e) = std::os::unix::fs::symlink(hospice, origin) {
                log::warn!("create symlink for {origin:?} failed: {e}");
            }
        }
    }

    /// Undo hospice entries that the current policy no longer produces.
    ///
    /// Two cases: a recorded unit whose mapping changed between releases
    /// gets its origin restored (when it had been symlinked away) and its
    /// hospice copy dropped; and, on the first run after an upgrade from
    /// the whole-directory scheme (no record file), stale whole-directory
    /// copies of per-file specs are migrated back.
    pub fn recover_deprecated(&self, restoring: bool) {
        if !self.record_existed {
            self.recover_superseded_whole_dirs(restoring);
        }

        for (origin, hospice) in &self.last {
            if self.current.get(origin) == Some(hospice) {
                continue;
            }
            match util::is_symlink(origin) {
                Ok(true) => {
                    if let Err(e) = remove_any(Path::new(origin)) {
                        log::warn!("remove origin dir failed: {e}");
                        continue;
                    }
                    if let Err(e) = copy_preserving(Path::new(hospice), Path::new(origin)) {
                        log::warn!("run cp command failed: {e}");
                        continue;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("is_symlink {origin:?} failed: {e}");
                    continue;
                }
            }
            if let Err(e) = remove_any(Path::new(hospice)) {
                log::warn!("remove backup file or dir failed: {e}");
            }
        }
    }

    fn recover_superseded_whole_dirs(&self, restoring: bool) {
        for spec in &self.specs {
            let Some(files) = &spec.files else { continue };
            let old_backup = self.hospice_root.join(spec.hospice_child());
            if !old_backup.exists() {
                continue;
            }

            let is_sym = match util::is_symlink(&spec.origin) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("is_symlink {:?} failed: {e}", spec.origin);
                    continue;
                }
            };

            if is_sym {
                if let Err(e) = remove_any(&spec.origin) {
                    log::warn!("remove origin dir failed: {e}");
                    continue;
                }
                if let Err(e) = fs::rename(&old_backup, &spec.origin) {
                    log::warn!("mv backup dir to origin dir failed: {e}");
                }
                continue;
            }

            if restoring {
                for file in files {
                    let source = old_backup.join(file);
                    if !source.exists() {
                        continue;
                    }
                    if let Err(e) = copy_preserving(&source, &spec.origin.join(file)) {
                        log::warn!("restore {file:?} from old backup failed: {e}");
                    }
                }
            }
            if let Err(e) = remove_any(&old_backup) {
                log::warn!("remove old backup dir failed: {e}");
            }
        }
    }
}

/// Copy with attributes, as `cp -a`
fn copy_preserving(source: &Path, dest: &Path) -> Result<(), String> {
    let status = Command::new("cp")
        .arg("-a")
        .arg(source)
        .arg(dest)
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("cp exited with {status}"))
    }
}

/// Remove a path of any kind; a missing path is fine
fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare_tree(base: &Path, data: &[(&str, &str)]) {
        for (rel, content) in data {
            let path = base.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
    }

    const TREE: [(&str, &str); 2] = [("abc", "ABC"), ("dir/def", "DEF")];

    #[test]
    fn current_map_expansion() {
        let specs = vec![
            ExtraDirSpec {
                origin: PathBuf::from("/var/lib/systemd"),
                hospice_subdir: None,
                files: None,
            },
            ExtraDirSpec {
                origin: PathBuf::from("/var/uos"),
                hospice_subdir: None,
                files: Some(vec!["os-license".to_string()]),
            },
        ];
        let registry = ExtraRegistry::load("/nonexistent/record.json", "/hospice", specs);

        assert_eq!(
            registry.current.get("/var/lib/systemd").map(String::as_str),
            Some("/hospice/systemd")
        );
        assert_eq!(
            registry.current.get("/var/uos/os-license").map(String::as_str),
            Some("/hospice/uos/os-license")
        );
        assert!(registry.last.is_empty());
    }

    #[test]
    fn backup_phase_copies_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("var/lib/xyz");
        prepare_tree(&origin, &TREE);

        let specs = vec![ExtraDirSpec {
            origin: origin.clone(),
            hospice_subdir: None,
            files: None,
        }];
        let registry = ExtraRegistry::load(
            tmp.path().join("record.json"),
            tmp.path().join("hospice"),
            specs,
        );

        registry.backup_phase();
        registry.backup_phase();

        let hospice = tmp.path().join("hospice/xyz");
        assert_eq!(fs::read_to_string(hospice.join("abc")).unwrap(), "ABC");
        assert_eq!(fs::read_to_string(hospice.join("dir/def")).unwrap(), "DEF");
    }

    #[test]
    fn restore_phase_symlinks_back() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("var/lib/xyz");
        prepare_tree(&origin, &TREE);
        let hospice = tmp.path().join("hospice/xyz");
        prepare_tree(&hospice, &TREE);

        let record = tmp.path().join("record.json");
        let mut map = BTreeMap::new();
        map.insert(
            origin.to_string_lossy().into_owned(),
            hospice.to_string_lossy().into_owned(),
        );
        fs::write(&record, serde_json::to_vec(&map).unwrap()).unwrap();

        let specs = vec![ExtraDirSpec {
            origin: origin.clone(),
            hospice_subdir: None,
            files: None,
        }];
        let registry = ExtraRegistry::load(&record, tmp.path().join("hospice"), specs);

        registry.restore_phase();
        registry.restore_phase();

        assert!(util::is_symlink(&origin).unwrap());
        assert_eq!(fs::read_to_string(origin.join("abc")).unwrap(), "ABC");

        // writes through the link are seen at the origin
        fs::write(hospice.join("abc"), "ABC123").unwrap();
        assert_eq!(fs::read_to_string(origin.join("abc")).unwrap(), "ABC123");
    }

    #[test]
    fn deprecated_entries_are_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("var/lib/old");
        let hospice = tmp.path().join("hospice/old");
        prepare_tree(&hospice, &TREE);
        fs::create_dir_all(origin.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(&hospice, &origin).unwrap();

        let record = tmp.path().join("record.json");
        let mut map = BTreeMap::new();
        map.insert(
            origin.to_string_lossy().into_owned(),
            hospice.to_string_lossy().into_owned(),
        );
        fs::write(&record, serde_json::to_vec(&map).unwrap()).unwrap();

        // policy no longer covers the old origin
        let registry = ExtraRegistry::load(&record, tmp.path().join("hospice"), vec![]);
        registry.recover_deprecated(false);

        assert!(!hospice.exists());
        assert!(!util::is_symlink(&origin).unwrap());
        assert_eq!(fs::read_to_string(origin.join("abc")).unwrap(), "ABC");
    }

    #[test]
    fn unchanged_entries_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("var/lib/xyz");
        prepare_tree(&origin, &TREE);
        let hospice_root = tmp.path().join("hospice");
        let hospice = hospice_root.join("xyz");
        prepare_tree(&hospice, &TREE);

        let record = tmp.path().join("record.json");
        let mut map = BTreeMap::new();
        map.insert(
            origin.to_string_lossy().into_owned(),
            hospice.to_string_lossy().into_owned(),
        );
        fs::write(&record, serde_json::to_vec(&map).unwrap()).unwrap();

        let specs = vec![ExtraDirSpec {
            origin: origin.clone(),
            hospice_subdir: None,
            files: None,
        }];
        let registry = ExtraRegistry::load(&record, &hospice_root, specs);
        registry.recover_deprecated(true);

        assert!(hospice.exists());
    }
}
