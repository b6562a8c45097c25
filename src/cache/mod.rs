// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent per-account caches for tokens and device lists.
//!
//! Both caches share the same storage discipline: one JSON file per
//! account under the cache root, named by an MD5 hash of the account
//! email, written with a rename-over replacement so readers never
//! observe a torn file. Files are mode 0600 inside a 0700 directory.
//! A corrupt or unreadable file is simply a miss; the next write
//! replaces it.
//!
//! All cache I/O is synchronous: it only happens on the cold paths
//! (startup, authentication, discovery), never per message.

mod device;
mod token;

pub use device::DeviceCache;
pub use token::{CachedToken, TokenCache, TokenStage};

use std::fs;
use std::io;
use std::io::Write as _;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Hex-encoded MD5 of the account email; the per-account file key.
#[must_use]
pub fn email_hash(email: &str) -> String {
    let digest = Md5::digest(email.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Ensures the cache root exists with owner-only permissions.
pub(crate) fn ensure_directory(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

/// Reads and deserializes a cache file. Any failure is a miss.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "Discarding corrupt cache file");
            None
        }
    }
}

/// Serializes `value` and replaces `path` atomically.
///
/// The content lands in a sibling temporary file with 0600 permissions,
/// then a rename makes it visible, so a crash mid-write leaves either
/// the old file or the new one, never a mixture.
pub(crate) fn write_json<T: Serialize>(dir: &Path, path: &Path, value: &T) -> io::Result<()> {
    ensure_directory(dir)?;
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = temp_path(path);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_hash_is_stable_md5() {
        // MD5 of the empty string is the classic fixed point.
        assert_eq!(email_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(email_hash("user@example.org"), email_hash("user@example.org"));
        assert_ne!(email_hash("a@example.org"), email_hash("b@example.org"));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_json(dir.path(), &path, &vec![1u32, 2, 3]).unwrap();
        let read: Vec<u32> = read_json(&path).unwrap();
        assert_eq!(read, vec![1, 2, 3]);
    }

    #[test]
    fn file_permissions_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_json(dir.path(), &path, &42u32).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(dir.path()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn corrupt_file_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        fs::write(&path, "{not json").unwrap();
        assert!(read_json::<Vec<u32>>(&path).is_none());
    }

    #[test]
    fn missing_file_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_json::<Vec<u32>>(&dir.path().join("absent.json")).is_none());
    }
}
