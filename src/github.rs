use crate::config::RemoteConfig;
use crate::error::{RemoteError, SyncError};
use crate::model::Snapshot;
use crate::remote::{RemoteSnapshot, RemoteStore, VersionToken};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutContent,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// The remote document as a file in a GitHub repository, accessed through
/// the REST contents API. The blob sha is the version token.
pub struct GitHubRemote {
    config: RemoteConfig,
    client: Client,
    device_id: String,
    timeout: Duration,
}

impl GitHubRemote {
    pub fn new(config: RemoteConfig, device_id: String, timeout: Duration) -> Result<Self, SyncError> {
        if !config.configured() {
            return Err(SyncError::NotConfigured);
        }
        let token = config.token.as_deref().unwrap_or_default().trim();
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RemoteError::Unauthorized)?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tekstil-sync/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        Ok(GitHubRemote {
            config,
            client,
            device_id,
            timeout,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Unavailable(e.to_string())
        }
    }

    async fn api_error(&self, response: reqwest::Response, writing: bool) -> RemoteError {
        let status = response.status();
        let body: ApiError = response.json().await.unwrap_or_default();
        let error = status_error(status, &body.message, writing);
        tracing::debug!(%status, message = %body.message, "GitHub API error");
        error
    }
}

/// Map a non-success status of the contents API onto the remote taxonomy.
fn status_error(status: StatusCode, message: &str, writing: bool) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY if writing => {
            RemoteError::VersionConflict
        }
        StatusCode::FORBIDDEN if message.to_lowercase().contains("rate limit") => {
            RemoteError::Unavailable(format!("rate limited: {message}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable(format!("rate limited: {message}")),
        s if s.is_server_error() => RemoteError::Unavailable(format!("HTTP {s}")),
        s => RemoteError::Unavailable(format!("HTTP {s}: {message}")),
    }
}

fn decode_content(response: &ContentsResponse) -> Result<Snapshot, RemoteError> {
    if !response.encoding.is_empty() && response.encoding != "base64" {
        return Err(RemoteError::Malformed(format!(
            "unsupported content encoding '{}'",
            response.encoding
        )));
    }
    let compact: String = response
        .content
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| RemoteError::Malformed(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Malformed(e.to_string()))
}

#[async_trait]
impl RemoteStore for GitHubRemote {
    async fn fetch_snapshot(&self) -> Result<RemoteSnapshot, RemoteError> {
        let url = self.config.contents_url();
        tracing::debug!(%url, "fetching remote document");
        let response = self
            .client
            .get(&url)
            .query(&[("ref", self.config.branch.as_str())])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.api_error(response, false).await);
        }
        let body: ContentsResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let snapshot = decode_content(&body)?;
        Ok(RemoteSnapshot {
            snapshot,
            token: body.sha,
        })
    }

    async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        expected: Option<&str>,
    ) -> Result<VersionToken, RemoteError> {
        let url = self.config.contents_url();
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let request = PutRequest {
            message: format!(
                "Update data - {} - Device: {}",
                Utc::now().to_rfc3339(),
                self.device_id
            ),
            content: STANDARD.encode(json.as_bytes()),
            branch: &self.config.branch,
            sha: expected,
        };
        tracing::debug!(%url, has_token = expected.is_some(), "writing remote document");
        let response = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.api_error(response, true).await);
        }
        let body: PutResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(body.content.sha)
    }

    fn describe(&self) -> String {
        format!(
            "github:{}/{}@{}:{}",
            self.config.owner, self.config.repo, self.config.branch, self.config.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::epoch;

    fn configured() -> RemoteConfig {
        RemoteConfig {
            owner: "budi".to_string(),
            token: Some("ghp_test".to_string()),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn new_requires_configuration() {
        let result = GitHubRemote::new(
            RemoteConfig::default(),
            "device_x".to_string(),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(SyncError::NotConfigured)));
    }

    #[test]
    fn describe_names_the_document() {
        let remote =
            GitHubRemote::new(configured(), "device_x".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(remote.describe(), "github:budi/sistem-upah-tekstil@main:data.json");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_error(StatusCode::NOT_FOUND, "", false), RemoteError::NotFound);
        assert_eq!(
            status_error(StatusCode::CONFLICT, "sha mismatch", true),
            RemoteError::VersionConflict
        );
        assert_eq!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "sha wasn't supplied", true),
            RemoteError::VersionConflict
        );
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED, "Bad credentials", false),
            RemoteError::Unauthorized
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "Resource not accessible", true),
            RemoteError::Unauthorized
        );
        assert!(status_error(StatusCode::FORBIDDEN, "API rate limit exceeded", false).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "", true).is_transient());
        // A 409 on read is not a version conflict
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "", false),
            RemoteError::Unavailable(_)
        ));
    }

    #[test]
    fn decode_wrapped_base64() {
        let snap = Snapshot::new(epoch(), Some("device_a".to_string()));
        let encoded = STANDARD.encode(serde_json::to_vec(&snap).unwrap());
        // The API wraps content at 60 characters
        let wrapped = encoded
            .as_bytes()
            .chunks(60)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let response = ContentsResponse {
            sha: "abc".to_string(),
            content: wrapped,
            encoding: "base64".to_string(),
        };
        assert_eq!(decode_content(&response).unwrap(), snap);
    }

    #[test]
    fn decode_rejects_other_encodings() {
        let response = ContentsResponse {
            sha: "abc".to_string(),
            content: String::new(),
            encoding: "none".to_string(),
        };
        assert!(matches!(decode_content(&response), Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn put_request_omits_sha_on_create() {
        let request = PutRequest {
            message: "m".to_string(),
            content: "e30=".to_string(),
            branch: "main",
            sha: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("sha").is_none());
        assert_eq!(value["branch"], "main");
    }
}
