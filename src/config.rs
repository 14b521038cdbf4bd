use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_REPO: &str = "sistem-upah-tekstil";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_PATH: &str = "data.json";

/// Where the remote document lives and the credential used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub owner: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured_at: Option<DateTime<Utc>>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            owner: String::new(),
            repo: default_repo(),
            branch: default_branch(),
            path: default_path(),
            token: None,
            api_base: default_api_base(),
            configured_at: None,
        }
    }
}

impl RemoteConfig {
    /// An owner, a repository and a non-empty token are all required.
    pub fn configured(&self) -> bool {
        !self.owner.trim().is_empty()
            && !self.repo.trim().is_empty()
            && self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.path.trim_start_matches('/')
        )
    }
}

/// Timing and retention knobs of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub debounce_ms: u64,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
    pub backup_retention: usize,
    pub auto_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            max_retries: 5,
            retry_delay_ms: 2_000,
            debounce_ms: 2_000,
            interval_ms: 30_000,
            request_timeout_ms: 30_000,
            backup_retention: 5,
            auto_sync: true,
        }
    }
}

impl SyncPolicy {
    /// Delay before retry number `attempt` (0-based): `retry_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncPolicy,
}

fn default_repo() -> String {
    DEFAULT_REPO.to_string()
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_by_default() {
        assert!(!RemoteConfig::default().configured());
    }

    #[test]
    fn configured_requires_owner_and_token() {
        let mut cfg = RemoteConfig {
            owner: "budi".to_string(),
            ..RemoteConfig::default()
        };
        assert!(!cfg.configured());
        cfg.token = Some("  ".to_string());
        assert!(!cfg.configured());
        cfg.token = Some("ghp_x".to_string());
        assert!(cfg.configured());
    }

    #[test]
    fn contents_url() {
        let cfg = RemoteConfig {
            owner: "budi".to_string(),
            api_base: "https://api.github.com/".to_string(),
            ..RemoteConfig::default()
        };
        assert_eq!(
            cfg.contents_url(),
            "https://api.github.com/repos/budi/sistem-upah-tekstil/contents/data.json"
        );
    }

    #[test]
    fn backoff_doubles() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(32));
        assert_eq!(policy.backoff(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn partial_config_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"remote": {"owner": "budi"}}"#).unwrap();
        assert_eq!(cfg.remote.repo, DEFAULT_REPO);
        assert_eq!(cfg.remote.branch, DEFAULT_BRANCH);
        assert_eq!(cfg.sync, SyncPolicy::default());
    }
}
