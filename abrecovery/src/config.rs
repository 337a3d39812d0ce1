// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Persistent role configuration
//!
//! Tracks which root UUID is live and which is the backup, plus the OS
//! version and instant of the last completed backup. The JSON field names
//! are shared with the installer, do not rename them.

use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// UUID of the root the system is running from
    #[serde(rename = "Current")]
    pub current: String,

    /// UUID of the other root
    #[serde(rename = "Backup")]
    pub backup: String,

    /// OS version captured by the last backup
    #[serde(rename = "Version", default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Instant the last backup completed
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl RoleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let content = serde_json::to_vec(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Both role UUIDs must name block devices that currently exist
    pub fn check(&self) -> Result<(), String> {
        if !blockdev::uuid_has_device(&self.current) {
            return Err(format!("not found current disk {:?}", self.current));
        }
        if !blockdev::uuid_has_device(&self.backup) {
            return Err(format!("not found backup disk {:?}", self.backup));
        }
        Ok(())
    }

    /// Exchange the roles after a restore. The version and timestamp only
    /// describe a backup of the previously-live root, so they are cleared.
    pub fn swap_roles(&mut self) {
        std::mem::swap(&mut self.current, &mut self.backup);
        self.version = String::new();
        self.time = None;
    }
}
