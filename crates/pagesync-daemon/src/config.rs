//! Daemon configuration.
//!
//! Built once from CLI flags plus environment and passed explicitly into
//! the engine and its producers; there is no process-wide singleton.

use anyhow::{bail, Result};
use pagesync_core::PollScope;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the engine needs to run one synced tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the local synced tree.
    pub tree_root: PathBuf,
    /// Base URL of the remote document service API.
    pub base_url: String,
    /// Bearer token for the remote service.
    pub token: String,
    /// What the poller watches.
    pub poll_scope: PollScope,
    /// Interval between remote polls.
    pub poll_interval: Duration,
    /// Window within which rapid repeated events for one document
    /// coalesce into a single processing cycle.
    pub debounce_window: Duration,
    /// Upper bound on concurrent remote fetches during a poll batch.
    pub fetch_concurrency: usize,
    /// Retry ceiling for transient network failures.
    pub max_retries: u32,
}

impl Config {
    /// Assemble from CLI values and environment.
    ///
    /// Required environment variables:
    /// - `PAGESYNC_BASE_URL`: remote service API root
    /// - `PAGESYNC_TOKEN`: bearer token
    pub fn from_env(
        tree_root: PathBuf,
        scope: PollScope,
        poll_interval_secs: u64,
    ) -> Result<Self> {
        let base_url = match std::env::var("PAGESYNC_BASE_URL") {
            Ok(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => bail!("PAGESYNC_BASE_URL environment variable not set"),
        };
        let token = match std::env::var("PAGESYNC_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => bail!("PAGESYNC_TOKEN environment variable not set"),
        };

        Ok(Self {
            tree_root,
            base_url,
            token,
            poll_scope: scope,
            poll_interval: Duration::from_secs(poll_interval_secs),
            debounce_window: Duration::from_millis(500),
            fetch_concurrency: 5,
            max_retries: 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config {
            tree_root: PathBuf::from("/tmp/tree"),
            base_url: "https://wiki.example.com/api".into(),
            token: "secret".into(),
            poll_scope: PollScope::Collection("DOCS".into()),
            poll_interval: Duration::from_secs(30),
            debounce_window: Duration::from_millis(500),
            fetch_concurrency: 5,
            max_retries: 4,
        };
        assert_eq!(config.fetch_concurrency, 5);
        assert_eq!(config.max_retries, 4);
    }
}
