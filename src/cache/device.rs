// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account cached device list with a time-to-live.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cloud::Device;

use super::{email_hash, now_unix, read_json, write_json};

#[derive(Debug, Serialize, Deserialize)]
struct CachedDevices {
    cached_at: u64,
    devices: Vec<Device>,
}

/// Persistent device list cache.
///
/// Discovery is expensive (signed, paged vendor calls), while device
/// lists change rarely; a lookup is a hit while the entry is younger
/// than the TTL.
#[derive(Debug, Clone)]
pub struct DeviceCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DeviceCache {
    /// Default TTL in seconds (24 h).
    pub const DEFAULT_TTL: u64 = 86_400;

    /// Creates the cache over `dir`, creating the directory with
    /// owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created; the
    /// caller treats this as fatal at startup.
    pub fn new(dir: &Path, ttl: Duration) -> io::Result<Self> {
        super::ensure_directory(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            ttl,
        })
    }

    /// Returns the cached device list, or `None` when absent, corrupt,
    /// or older than the TTL.
    #[must_use]
    pub fn get(&self, email: &str) -> Option<Vec<Device>> {
        let entry: CachedDevices = read_json(&self.file_path(email))?;
        let age = now_unix().saturating_sub(entry.cached_at);
        if age > self.ttl.as_secs() {
            tracing::debug!(age, "Device cache entry past TTL, treating as miss");
            return None;
        }
        tracing::debug!(age, count = entry.devices.len(), "Device cache hit");
        Some(entry.devices)
    }

    /// Replaces the cached device list for `email`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be replaced.
    pub fn put(&self, email: &str, devices: &[Device]) -> io::Result<()> {
        let entry = CachedDevices {
            cached_at: now_unix(),
            devices: devices.to_vec(),
        };
        write_json(&self.dir, &self.file_path(email), &entry)
    }

    /// Removes the cached list for `email`.
    pub fn invalidate(&self, email: &str) {
        let path = self.file_path(email);
        if std::fs::remove_file(&path).is_ok() {
            tracing::debug!(path = %path.display(), "Invalidated device cache");
        }
    }

    /// Seconds since the last write for `email`, if a readable entry
    /// exists.
    #[must_use]
    pub fn age(&self, email: &str) -> Option<Duration> {
        let entry: CachedDevices = read_json(&self.file_path(email))?;
        Some(Duration::from_secs(now_unix().saturating_sub(entry.cached_at)))
    }

    fn file_path(&self, email: &str) -> PathBuf {
        self.dir.join(format!("devices_{}.json", email_hash(email)))
    }
}
