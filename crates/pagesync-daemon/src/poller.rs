//! Remote poll producer.
//!
//! Runs on a configurable interval and normalizes remote changes into the
//! shared `ChangeEvent` shape. Subtree and collection scopes use the
//! incremental changed-since cursor so each poll only touches documents
//! changed since the last one; single-document scope is a direct point
//! fetch.

use pagesync_core::{
    ChangeEvent, ChangeKind, ChangeOrigin, DocumentRef, PollScope, RemoteService, SyncError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

pub struct Poller {
    remote: Arc<dyn RemoteService>,
    scope: PollScope,
    interval: Duration,
    /// Incremental cursor, seeded from the store at startup. Advances
    /// are reported back for persistence by the consumer.
    cursor: Option<String>,
    /// Last remote version seen per document, so an unchanged point
    /// fetch does not queue a redundant cycle.
    seen_versions: HashMap<String, u64>,
    event_tx: mpsc::UnboundedSender<ChangeEvent>,
    cursor_tx: mpsc::UnboundedSender<String>,
}

impl Poller {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        scope: PollScope,
        interval: Duration,
        initial_cursor: Option<String>,
        event_tx: mpsc::UnboundedSender<ChangeEvent>,
        cursor_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            remote,
            scope,
            interval,
            cursor: initial_cursor,
            seen_versions: HashMap::new(),
            event_tx,
            cursor_tx,
        }
    }

    /// Poll until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately: one reconcile pass on startup
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Remote poll failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Poller stopping");
                    return;
                }
            }
        }
    }

    /// One poll pass; emits normalized events for everything changed.
    pub async fn poll_once(&mut self) -> Result<(), SyncError> {
        match &self.scope {
            PollScope::Document(id) => {
                let id = id.clone();
                self.poll_document(&id).await
            }
            PollScope::Subtree(_) | PollScope::Collection(_) => self.poll_incremental().await,
        }
    }

    async fn poll_document(&mut self, id: &str) -> Result<(), SyncError> {
        match self.remote.fetch(id).await {
            Ok(page) => {
                let known = self.seen_versions.get(id).copied();
                if known == Some(page.version) {
                    return Ok(());
                }
                let kind = if known.is_none() {
                    ChangeKind::Created
                } else {
                    ChangeKind::Changed
                };
                self.seen_versions.insert(id.to_string(), page.version);
                self.emit(DocumentRef::by_id(id), kind);
                Ok(())
            }
            Err(SyncError::RemoteNotFound(_)) => {
                if self.seen_versions.remove(id).is_some() {
                    self.emit(DocumentRef::by_id(id), ChangeKind::Deleted);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_incremental(&mut self) -> Result<(), SyncError> {
        let changes = self
            .remote
            .changed_since(&self.scope, self.cursor.as_ref())
            .await?;

        debug!(
            "Poll found {} changed, {} deleted (cursor {:?})",
            changes.pages.len(),
            changes.deleted.len(),
            self.cursor
        );

        for page in &changes.pages {
            let known = self.seen_versions.insert(page.id.clone(), page.version);
            let kind = match known {
                None => ChangeKind::Created,
                Some(v) if v == page.version => continue,
                Some(_) => ChangeKind::Changed,
            };
            self.emit(DocumentRef::by_id(&page.id), kind);
        }
        for id in &changes.deleted {
            self.seen_versions.remove(id);
            self.emit(DocumentRef::by_id(id), ChangeKind::Deleted);
        }

        if self.cursor.as_deref() != Some(changes.next_cursor.as_str()) {
            self.cursor = Some(changes.next_cursor.clone());
            let _ = self.cursor_tx.send(changes.next_cursor);
        }
        Ok(())
    }

    fn emit(&self, document: DocumentRef, kind: ChangeKind) {
        let event = ChangeEvent::new(ChangeOrigin::Remote, document, kind);
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagesync_core::remote::memory::InMemoryRemote;

    fn poller_for(
        remote: Arc<InMemoryRemote>,
        scope: PollScope,
    ) -> (
        Poller,
        mpsc::UnboundedReceiver<ChangeEvent>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cursor_tx, cursor_rx) = mpsc::unbounded_channel();
        let poller = Poller::new(
            remote,
            scope,
            Duration::from_secs(60),
            None,
            event_tx,
            cursor_tx,
        );
        (poller, event_rx, cursor_rx)
    }

    #[tokio::test]
    async fn test_incremental_poll_emits_and_advances_cursor() {
        let remote = Arc::new(InMemoryRemote::new());
        let page = remote.create("A", None, "body").await.unwrap();

        let (mut poller, mut events, mut cursors) =
            poller_for(Arc::clone(&remote), PollScope::Collection("all".into()));

        poller.poll_once().await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.origin, ChangeOrigin::Remote);
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.document.id.as_deref(), Some(page.id.as_str()));
        assert!(cursors.try_recv().is_ok());

        // Nothing changed: second poll emits nothing new
        poller.poll_once().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incremental_poll_reports_deletes() {
        let remote = Arc::new(InMemoryRemote::new());
        let page = remote.create("A", None, "body").await.unwrap();

        let (mut poller, mut events, _cursors) =
            poller_for(Arc::clone(&remote), PollScope::Collection("all".into()));
        poller.poll_once().await.unwrap();
        let _ = events.try_recv();

        remote.delete(&page.id).await.unwrap();
        poller.poll_once().await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_document_scope_point_fetch() {
        let remote = Arc::new(InMemoryRemote::new());
        let page = remote.create("A", None, "v1").await.unwrap();

        let (mut poller, mut events, _cursors) =
            poller_for(Arc::clone(&remote), PollScope::Document(page.id.clone()));

        poller.poll_once().await.unwrap();
        assert_eq!(events.try_recv().unwrap().kind, ChangeKind::Created);

        // Unchanged version: no event
        poller.poll_once().await.unwrap();
        assert!(events.try_recv().is_err());

        remote.update(&page.id, "A", "v2", 1).await.unwrap();
        poller.poll_once().await.unwrap();
        assert_eq!(events.try_recv().unwrap().kind, ChangeKind::Changed);
    }
}
