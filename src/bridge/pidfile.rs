// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-instance lock via a PID file.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::Error;

/// Holds the PID file for the lifetime of the daemon; releases it on
/// drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current PID, refusing to start when another live
    /// instance holds the file. A stale file (dead process) is removed
    /// automatically; an unparseable file is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] when another instance is running, the
    /// file is corrupt, or the file cannot be written.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        if let Ok(content) = fs::read_to_string(path) {
            let pid: i32 = content.trim().parse().map_err(|_| {
                Error::Fatal(format!(
                    "corrupted PID file {}: {content:?}",
                    path.display()
                ))
            })?;
            let own_pid = i32::try_from(std::process::id()).unwrap_or_default();
            if pid != own_pid && process_alive(pid) {
                return Err(Error::Fatal(format!(
                    "another instance is running (pid {pid}, {})",
                    path.display()
                )));
            }
            tracing::warn!(pid, path = %path.display(), "Removing stale PID file");
            fs::remove_file(path)
                .map_err(|e| Error::Fatal(format!("cannot remove stale PID file: {e}")))?;
        }

        fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| Error::Fatal(format!("cannot write PID file {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "PID file acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Removes the PID file now instead of at drop time.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %error, "Cannot remove PID file");
        }
    }
}

/// Whether a process with this PID exists. Signal 0 probes without
/// delivering; EPERM still means the process is there.
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
