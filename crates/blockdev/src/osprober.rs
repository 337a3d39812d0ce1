// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Foreign OS detection via `os-prober`
//!
//! os-prober scans every attached disk and can stall on slow media, so the
//! probe runs under a hard deadline. A timeout is a recoverable failure.

use std::{
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::Error;

const OS_PROBER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Recognized labels of roots this tool manages
const OS_LABELS: [&str; 2] = ["uos", "deepin"];

/// Parse `os-prober` output (`device:name:label:kind` records), keeping
/// linux entries whose label is one of ours.
pub fn parse_os_prober_output(data: &str) -> Vec<PathBuf> {
    let mut devices = Vec::new();
    for line in data.lines() {
        let fields: Vec<&str> = line.splitn(4, ':').collect();
        if fields.len() < 4 {
            continue;
        }
        let label = fields[2].to_ascii_lowercase();
        let kind = fields[3].to_ascii_lowercase();
        if OS_LABELS.contains(&label.as_str()) && kind == "linux" {
            devices.push(PathBuf::from(fields[0]));
        }
    }
    devices
}

/// Enumerate foreign OS root devices, killing the probe after five minutes
pub fn probe_foreign_os_roots() -> Result<Vec<PathBuf>, Error> {
    let mut child = Command::new("os-prober")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + OS_PROBER_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut out = String::new();
            if let Some(mut stdout) = child.stdout.take() {
                stdout.read_to_string(&mut out)?;
            }
            if !status.success() {
                return Err(Error::Enumeration(format!("os-prober exited with {status}")));
            }
            return Ok(parse_os_prober_output(&out));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
