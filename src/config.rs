//! Configuration for the sync layer.

use crate::error::{Result, SyncError};
use crate::types::{ThreadId, UserId};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Remote path layout.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollectionPaths {
    /// Top-level thread collection.
    pub threads: String,
    /// Per-thread subcollection of read cursors, keyed by user id.
    pub reads: String,
    /// Per-thread subcollection of messages.
    pub messages: String,
    /// Top-level profile collection.
    pub users: String,
}

impl Default for CollectionPaths {
    fn default() -> Self {
        Self {
            threads: "threads".to_string(),
            reads: "reads".to_string(),
            messages: "messages".to_string(),
            users: "users".to_string(),
        }
    }
}

impl CollectionPaths {
    pub fn thread(&self, thread: &ThreadId) -> String {
        format!("{}/{}", self.threads, thread)
    }

    pub fn cursor(&self, thread: &ThreadId, user: &UserId) -> String {
        format!("{}/{}/{}/{}", self.threads, thread, self.reads, user)
    }

    pub fn messages(&self, thread: &ThreadId) -> String {
        format!("{}/{}/{}", self.threads, thread, self.messages)
    }

    pub fn profile(&self, user: &UserId) -> String {
        format!("{}/{}", self.users, user)
    }

    /// Inverse of [`CollectionPaths::profile`].
    pub fn user_of_profile_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.users.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

/// Unread engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UnreadConfig {
    /// Window in which invalidations of one rail collapse into one recompute.
    /// Default: 50ms
    pub recompute_debounce_ms: u64,

    /// Promote counterparts of published entries to live profile watches.
    /// Default: true
    pub promote_live_profiles: bool,
}

impl Default for UnreadConfig {
    fn default() -> Self {
        Self {
            recompute_debounce_ms: 50,
            promote_live_profiles: true,
        }
    }
}

/// Profile cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProfileCacheConfig {
    /// Freshness window of a fetched profile.
    /// Default: 5 minutes
    pub ttl_ms: u64,

    /// Requests within this window share one batch fetch.
    /// Default: 25ms
    pub batch_window_ms: u64,

    /// Max keys per batch fetch.
    /// Default: 20
    pub max_batch_size: usize,

    /// Max simultaneously live profile watches.
    /// Default: 10
    pub max_live: usize,

    /// Cadence for refreshing profiles that did not get a live slot.
    /// Default: 2s
    pub poll_interval_ms: u64,

    /// Profiles refreshed per poll tick.
    /// Default: 5
    pub poll_batch_size: usize,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            batch_window_ms: 25,
            max_batch_size: 20,
            max_live: 10,
            poll_interval_ms: 2_000,
            poll_batch_size: 5,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub paths: CollectionPaths,
    pub unread: UnreadConfig,
    pub profiles: ProfileCacheConfig,
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON config; missing fields keep defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.profiles;
        let zero = [
            ("profiles.ttl_ms", p.ttl_ms == 0),
            ("profiles.max_batch_size", p.max_batch_size == 0),
            ("profiles.max_live", p.max_live == 0),
            ("profiles.poll_interval_ms", p.poll_interval_ms == 0),
            ("profiles.poll_batch_size", p.poll_batch_size == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(SyncError::InvalidConfig(format!("{} must be > 0", field)));
        }

        let paths = [
            &self.paths.threads,
            &self.paths.reads,
            &self.paths.messages,
            &self.paths.users,
        ];
        if paths.iter().any(|p| p.is_empty() || p.contains('/')) {
            return Err(SyncError::InvalidConfig(
                "collection names must be non-empty single segments".into(),
            ));
        }
        Ok(())
    }
}
