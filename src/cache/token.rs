// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account, per-stage token cache with safety-margin semantics.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{email_hash, now_unix, read_json, write_json};

/// The three authentication stages, each cached independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenStage {
    /// Short-lived anonymous access token (stage 1, ~10 min).
    Anonymous,
    /// Long-lived user login token (stage 2, near-permanent).
    Login,
    /// MQTT JWT whose expiry is its `exp` claim (stage 3, ~3 days).
    Mqtt,
}

impl TokenStage {
    /// Stage slot name used as the JSON key inside the cache file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anonymous => "s1_anonymous",
            Self::Login => "s2_login",
            Self::Mqtt => "s3_mqtt",
        }
    }
}

/// A cached token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    /// The opaque token value.
    pub token: String,
    /// Absolute expiry, seconds since the Unix epoch.
    pub expires_at: u64,
    /// When the entry was written, seconds since the Unix epoch.
    pub cached_at: u64,
}

/// TTL-bounded persistent token store.
///
/// A lookup is a hit only when the entry outlives `now` by more than the
/// safety margin, so a token is never reused so close to its expiry that
/// it could lapse mid-handshake.
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
    safety_margin: Duration,
}

impl TokenCache {
    /// Default safety margin in seconds.
    pub const DEFAULT_SAFETY_MARGIN: u64 = 300;

    /// Creates the cache over `dir`, creating the directory with
    /// owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created; the
    /// caller treats this as fatal at startup.
    pub fn new(dir: &Path, safety_margin: Duration) -> io::Result<Self> {
        super::ensure_directory(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            safety_margin,
        })
    }

    /// Looks up a token for `email` at `stage`.
    ///
    /// Returns `None` when absent, unreadable, or expiring within the
    /// safety margin.
    #[must_use]
    pub fn get(&self, email: &str, stage: TokenStage) -> Option<CachedToken> {
        let entries: HashMap<String, CachedToken> = read_json(&self.file_path(email))?;
        let entry = entries.get(stage.as_str())?;
        let deadline = now_unix().checked_add(self.safety_margin.as_secs())?;
        if entry.expires_at > deadline {
            tracing::debug!(
                stage = stage.as_str(),
                expires_at = entry.expires_at,
                "Token cache hit"
            );
            Some(entry.clone())
        } else {
            tracing::debug!(
                stage = stage.as_str(),
                expires_at = entry.expires_at,
                "Token cache entry within safety margin, treating as miss"
            );
            None
        }
    }

    /// Writes a token for `email` at `stage`, preserving other stages.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be replaced.
    pub fn put(&self, email: &str, stage: TokenStage, token: &str, expires_at: u64) -> io::Result<()> {
        let path = self.file_path(email);
        let mut entries: HashMap<String, CachedToken> = read_json(&path).unwrap_or_default();
        entries.insert(
            stage.as_str().to_string(),
            CachedToken {
                token: token.to_string(),
                expires_at,
                cached_at: now_unix(),
            },
        );
        write_json(&self.dir, &path, &entries)
    }

    /// Removes every stage for `email`.
    pub fn invalidate(&self, email: &str) {
        let path = self.file_path(email);
        if std::fs::remove_file(&path).is_ok() {
            tracing::debug!(path = %path.display(), "Invalidated token cache");
        }
    }

    fn file_path(&self, email: &str) -> PathBuf {
        self.dir.join(format!("{}.json", email_hash(email)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMAIL: &str = "user@example.org";

    fn cache(dir: &Path) -> TokenCache {
        TokenCache::new(dir, Duration::from_secs(300)).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let expiry = now_unix() + 3600;
        cache.put(EMAIL, TokenStage::Login, "tok-login", expiry).unwrap();

        let entry = cache.get(EMAIL, TokenStage::Login).unwrap();
        assert_eq!(entry.token, "tok-login");
        assert_eq!(entry.expires_at, expiry);
    }

    #[test]
    fn stages_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let expiry = now_unix() + 3600;
        cache.put(EMAIL, TokenStage::Anonymous, "tok-anon", expiry).unwrap();
        cache.put(EMAIL, TokenStage::Mqtt, "tok-mqtt", expiry).unwrap();

        assert_eq!(cache.get(EMAIL, TokenStage::Anonymous).unwrap().token, "tok-anon");
        assert_eq!(cache.get(EMAIL, TokenStage::Mqtt).unwrap().token, "tok-mqtt");
        assert!(cache.get(EMAIL, TokenStage::Login).is_none());
    }

    #[test]
    fn entry_within_safety_margin_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        // Expires in 200 s, margin is 300 s.
        cache
            .put(EMAIL, TokenStage::Anonymous, "tok", now_unix() + 200)
            .unwrap();
        assert!(cache.get(EMAIL, TokenStage::Anonymous).is_none());
    }

    #[test]
    fn entry_just_past_safety_margin_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache
            .put(EMAIL, TokenStage::Anonymous, "tok", now_unix() + 302)
            .unwrap();
        assert!(cache.get(EMAIL, TokenStage::Anonymous).is_some());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        cache.put(EMAIL, TokenStage::Mqtt, "tok", now_unix().saturating_sub(10)).unwrap();
        assert!(cache.get(EMAIL, TokenStage::Mqtt).is_none());
    }

    #[test]
    fn invalidate_removes_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let expiry = now_unix() + 3600;
        cache.put(EMAIL, TokenStage::Login, "a", expiry).unwrap();
        cache.put(EMAIL, TokenStage::Mqtt, "b", expiry).unwrap();

        cache.invalidate(EMAIL);
        assert!(cache.get(EMAIL, TokenStage::Login).is_none());
        assert!(cache.get(EMAIL, TokenStage::Mqtt).is_none());
    }

    #[test]
    fn accounts_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let expiry = now_unix() + 3600;
        cache.put("a@example.org", TokenStage::Login, "a", expiry).unwrap();
        cache.put("b@example.org", TokenStage::Login, "b", expiry).unwrap();

        cache.invalidate("a@example.org");
        assert!(cache.get("a@example.org", TokenStage::Login).is_none());
        assert_eq!(cache.get("b@example.org", TokenStage::Login).unwrap().token, "b");
    }

    #[test]
    fn corrupt_file_is_a_miss_and_put_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let path = dir.path().join(format!("{}.json", email_hash(EMAIL)));
        std::fs::write(&path, "garbage").unwrap();

        assert!(cache.get(EMAIL, TokenStage::Login).is_none());
        cache.put(EMAIL, TokenStage::Login, "fresh", now_unix() + 3600).unwrap();
        assert_eq!(cache.get(EMAIL, TokenStage::Login).unwrap().token, "fresh");
    }
}
