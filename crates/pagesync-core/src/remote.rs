//! Remote document service contract.
//!
//! The engine only ever talks to the remote through this trait: point
//! fetch, incremental changed-since queries, and version compare-and-swap
//! writes. The daemon provides the HTTP implementation; tests use
//! `InMemoryRemote`.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One document as the remote service sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    /// Monotonic version number; writes must pass `version + 1`.
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    pub parent_id: Option<String>,
    /// Page body in the rich storage format.
    pub body: String,
}

/// Scope of a changed-since query, bounding how many documents a poll
/// touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollScope {
    /// One document, fetched directly rather than via the cursor query.
    Document(String),
    /// A page and all of its descendants.
    Subtree(String),
    /// The whole collection.
    Collection(String),
}

/// Opaque incremental cursor for changed-since queries. The remote hands
/// back the next cursor with each page of results.
pub type ChangeCursor = String;

/// A page of changed-since results.
#[derive(Debug, Clone)]
pub struct ChangedSince {
    pub pages: Vec<RemotePage>,
    /// Ids the remote reports as deleted since the cursor.
    pub deleted: Vec<String>,
    pub next_cursor: ChangeCursor,
}

/// Read/write access to the remote versioned document service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Point fetch of one document by id.
    async fn fetch(&self, id: &str) -> Result<RemotePage>;

    /// Documents changed since `cursor` within `scope`. Incremental: the
    /// caller persists `next_cursor` between polls.
    async fn changed_since(
        &self,
        scope: &PollScope,
        cursor: Option<&ChangeCursor>,
    ) -> Result<ChangedSince>;

    /// Create a new document; returns the created page (with id and
    /// version assigned by the remote).
    async fn create(
        &self,
        title: &str,
        parent_id: Option<&str>,
        body: &str,
    ) -> Result<RemotePage>;

    /// Write body and title with optimistic concurrency: fails with
    /// `TransientNetwork` (version clash is retryable after a re-read)
    /// unless `expected_version` matches the remote's current version.
    async fn update(
        &self,
        id: &str,
        title: &str,
        body: &str,
        expected_version: u64,
    ) -> Result<RemotePage>;

    /// Delete a document.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory `RemoteService` for tests.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        pages: HashMap<String, RemotePage>,
        /// (sequence, id, deleted) change log backing changed_since
        log: Vec<(u64, String, bool)>,
    }

    /// Simple in-memory remote with a sequence-number change cursor.
    #[derive(Default)]
    pub struct InMemoryRemote {
        inner: Mutex<Inner>,
        next_id: AtomicU64,
        next_seq: AtomicU64,
    }

    impl InMemoryRemote {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a page directly, bypassing version checks.
        pub fn put(&self, page: RemotePage) {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.log.push((seq, page.id.clone(), false));
            inner.pages.insert(page.id.clone(), page);
        }

        pub fn get(&self, id: &str) -> Option<RemotePage> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.pages.get(id).cloned()
        }
    }

    #[async_trait]
    impl RemoteService for InMemoryRemote {
        async fn fetch(&self, id: &str) -> Result<RemotePage> {
            self.get(id)
                .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))
        }

        async fn changed_since(
            &self,
            _scope: &PollScope,
            cursor: Option<&ChangeCursor>,
        ) -> Result<ChangedSince> {
            let since: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let mut pages = Vec::new();
            let mut deleted = Vec::new();
            let mut max_seq = since;
            for (seq, id, was_deleted) in &inner.log {
                if *seq <= since {
                    continue;
                }
                max_seq = max_seq.max(*seq);
                if *was_deleted {
                    deleted.push(id.clone());
                } else if let Some(page) = inner.pages.get(id) {
                    if !pages.iter().any(|p: &RemotePage| p.id == page.id) {
                        pages.push(page.clone());
                    }
                }
            }
            Ok(ChangedSince {
                pages,
                deleted,
                next_cursor: max_seq.to_string(),
            })
        }

        async fn create(
            &self,
            title: &str,
            parent_id: Option<&str>,
            body: &str,
        ) -> Result<RemotePage> {
            let id = format!("{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let page = RemotePage {
                id: id.clone(),
                title: title.to_string(),
                version: 1,
                last_modified: Utc::now(),
                parent_id: parent_id.map(String::from),
                body: body.to_string(),
            };
            self.put(page.clone());
            Ok(page)
        }

        async fn update(
            &self,
            id: &str,
            title: &str,
            body: &str,
            expected_version: u64,
        ) -> Result<RemotePage> {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let page = inner
                .pages
                .get_mut(id)
                .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))?;
            if page.version != expected_version {
                return Err(SyncError::TransientNetwork(format!(
                    "version clash on {}: expected {}, remote at {}",
                    id, expected_version, page.version
                )));
            }
            page.title = title.to_string();
            page.body = body.to_string();
            page.version += 1;
            page.last_modified = Utc::now();
            let updated = page.clone();
            inner.log.push((seq, id.to_string(), false));
            Ok(updated)
        }

        async fn delete(&self, id: &str) -> Result<()> {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .pages
                .remove(id)
                .ok_or_else(|| SyncError::RemoteNotFound(id.to_string()))?;
            inner.log.push((seq, id.to_string(), true));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryRemote;
    use super::*;

    #[tokio::test]
    async fn test_create_and_fetch() {
        let remote = InMemoryRemote::new();
        let page = remote.create("Title", None, "<p>body</p>").await.unwrap();
        assert_eq!(page.version, 1);

        let fetched = remote.fetch(&page.id).await.unwrap();
        assert_eq!(fetched, page);
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let remote = InMemoryRemote::new();
        match remote.fetch("nope").await {
            Err(SyncError::RemoteNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected RemoteNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_compare_and_swap() {
        let remote = InMemoryRemote::new();
        let page = remote.create("T", None, "v1").await.unwrap();

        let updated = remote.update(&page.id, "T", "v2", 1).await.unwrap();
        assert_eq!(updated.version, 2);

        // Stale expected version clashes
        let clash = remote.update(&page.id, "T", "v3", 1).await;
        assert!(matches!(clash, Err(SyncError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn test_changed_since_is_incremental() {
        let remote = InMemoryRemote::new();
        let scope = PollScope::Collection("all".into());

        let a = remote.create("A", None, "a").await.unwrap();
        let first = remote.changed_since(&scope, None).await.unwrap();
        assert_eq!(first.pages.len(), 1);

        let b = remote.create("B", None, "b").await.unwrap();
        remote.delete(&a.id).await.unwrap();

        let second = remote
            .changed_since(&scope, Some(&first.next_cursor))
            .await
            .unwrap();
        assert_eq!(second.pages.len(), 1);
        assert_eq!(second.pages[0].id, b.id);
        assert_eq!(second.deleted, vec![a.id.clone()]);

        // Nothing new after the latest cursor
        let third = remote
            .changed_since(&scope, Some(&second.next_cursor))
            .await
            .unwrap();
        assert!(third.pages.is_empty());
        assert!(third.deleted.is_empty());
    }
}
