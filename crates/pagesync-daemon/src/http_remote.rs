//! HTTP client for the remote document service.
//!
//! Implements `RemoteService` over a JSON REST API with optimistic
//! concurrency on writes. Transient failures (timeouts, 5xx, 429) are
//! retried with exponential backoff up to the configured ceiling;
//! exhausting the ceiling surfaces `RetriesExhausted` rather than being
//! dropped silently. Permission failures are fatal on first sight.

use async_trait::async_trait;
use pagesync_core::error::{Result, SyncError};
use pagesync_core::remote::{ChangeCursor, ChangedSince, PollScope, RemotePage, RemoteService};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: String,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct WritePayload<'a> {
    title: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangedSincePayload {
    pages: Vec<RemotePage>,
    #[serde(default)]
    deleted: Vec<String>,
    next_cursor: ChangeCursor,
}

impl HttpRemote {
    pub fn new(base_url: String, token: String, max_retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::TransientNetwork(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
            max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    /// Execute a request, retrying transient failures with exponential
    /// backoff. `operation` and `id` only feed error reporting.
    async fn execute(
        &self,
        operation: &str,
        id: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = self.authed(build()).send().await;

            let retryable = match result {
                Ok(response) => match Self::classify(response) {
                    Ok(response) => return Ok(response),
                    Err(err) if err.is_retryable() => err,
                    Err(err) => return Err(err),
                },
                // Connection-level failures are transient by definition
                Err(err) => SyncError::TransientNetwork(err.to_string()),
            };

            if attempt > self.max_retries {
                warn!(
                    "{} on document {} failed after {} attempts: {}",
                    operation, id, attempt, retryable
                );
                return Err(SyncError::RetriesExhausted {
                    operation: operation.to_string(),
                    id: id.to_string(),
                });
            }

            debug!(
                "{} on {} hit {}; retrying in {:?} (attempt {}/{})",
                operation, id, retryable, backoff, attempt, self.max_retries
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// Map an HTTP status onto the error taxonomy.
    fn classify(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = format!("{} {}", status, response.url());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(SyncError::PermissionDenied(detail))
            }
            StatusCode::NOT_FOUND => Err(SyncError::RemoteNotFound(detail)),
            StatusCode::TOO_MANY_REQUESTS => Err(SyncError::TransientNetwork(detail)),
            s if s.is_server_error() => Err(SyncError::TransientNetwork(detail)),
            // Includes 409 version clashes: retry after the caller re-reads
            _ => Err(SyncError::TransientNetwork(detail)),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn fetch(&self, id: &str) -> Result<RemotePage> {
        let url = self.url(&format!("documents/{}", id));
        let response = self
            .execute("fetch", id, || self.client.get(&url))
            .await?;
        Self::json(response).await
    }

    async fn changed_since(
        &self,
        scope: &PollScope,
        cursor: Option<&ChangeCursor>,
    ) -> Result<ChangedSince> {
        let (scope_kind, scope_id) = match scope {
            PollScope::Document(id) => ("document", id),
            PollScope::Subtree(id) => ("subtree", id),
            PollScope::Collection(id) => ("collection", id),
        };
        let url = self.url("documents/changed");
        let response = self
            .execute("changed-since", scope_id, || {
                let mut req = self
                    .client
                    .get(&url)
                    .query(&[("scope", scope_kind), ("scopeId", scope_id)]);
                if let Some(cursor) = cursor {
                    req = req.query(&[("cursor", cursor.as_str())]);
                }
                req
            })
            .await?;
        let payload: ChangedSincePayload = Self::json(response).await?;
        Ok(ChangedSince {
            pages: payload.pages,
            deleted: payload.deleted,
            next_cursor: payload.next_cursor,
        })
    }

    async fn create(
        &self,
        title: &str,
        parent_id: Option<&str>,
        body: &str,
    ) -> Result<RemotePage> {
        let url = self.url("documents");
        let response = self
            .execute("create", title, || {
                self.client.post(&url).json(&WritePayload {
                    title,
                    body,
                    parent_id,
                    version: None,
                })
            })
            .await?;
        Self::json(response).await
    }

    async fn update(
        &self,
        id: &str,
        title: &str,
        body: &str,
        expected_version: u64,
    ) -> Result<RemotePage> {
        let url = self.url(&format!("documents/{}", id));
        let response = self
            .execute("update", id, || {
                self.client.put(&url).json(&WritePayload {
                    title,
                    body,
                    parent_id: None,
                    version: Some(expected_version + 1),
                })
            })
            .await?;
        Self::json(response).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("documents/{}", id));
        self.execute("delete", id, || self.client.delete(&url))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let remote = HttpRemote::new("https://wiki.example.com/api".into(), "t".into(), 3).unwrap();
        assert_eq!(
            remote.url("documents/42"),
            "https://wiki.example.com/api/documents/42"
        );
    }
}
