//! End-to-end tests for pagesync-daemon.
//!
//! Tests the full daemon behavior: producers feeding the arbitrated
//! queue, the serialized sync cycle, conflict surfacing and resolution,
//! all against an in-memory remote.

use std::sync::Arc;
use std::time::Duration;

use pagesync_core::remote::memory::InMemoryRemote;
use pagesync_core::{
    content_hash, has_conflict_markers, meta, ChangeEvent, ChangeKind, ChangeOrigin, DocumentRef,
    PollScope, RemoteService, Resolution, StateStore, SyncState,
};
use pagesync_daemon::{Arbitrator, Poller, SyncEngine, WebhookPayload, WebhookSource};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

// ============================================================================
// Helpers
// ============================================================================

/// A running daemon core: in-memory remote, engine, arbitrator task.
struct Harness {
    dir: TempDir,
    remote: Arc<InMemoryRemote>,
    event_tx: mpsc::UnboundedSender<ChangeEvent>,
    cursor_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    consumer: tokio::task::JoinHandle<SyncEngine>,
}

impl Harness {
    fn start() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let remote = Arc::new(InMemoryRemote::new());
        let store = StateStore::open(dir.path()).expect("store");
        let engine = SyncEngine::new(
            dir.path().to_path_buf(),
            Arc::clone(&remote) as Arc<dyn RemoteService>,
            store,
            5,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cursor_tx, cursor_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let arbitrator = Arbitrator::new(engine, event_rx, cursor_rx, Duration::from_millis(20));
        let consumer = tokio::spawn(arbitrator.run(shutdown_rx));

        Self {
            dir,
            remote,
            event_tx,
            cursor_tx,
            shutdown_tx,
            consumer,
        }
    }

    fn send_local(&self, path: &str, kind: ChangeKind) {
        self.event_tx
            .send(ChangeEvent::new(
                ChangeOrigin::Local,
                DocumentRef::by_path(path),
                kind,
            ))
            .expect("queue open");
    }

    fn send_remote(&self, id: &str, kind: ChangeKind) {
        self.event_tx
            .send(ChangeEvent::new(
                ChangeOrigin::Remote,
                DocumentRef::by_id(id),
                kind,
            ))
            .expect("queue open");
    }

    fn write_file(&self, path: &str, content: &str) {
        let abs = self.dir.path().join(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(abs, content).unwrap();
    }

    fn read_file(&self, path: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(path)).unwrap()
    }

    /// Rewrite a tracked file's body, preserving its metadata block.
    fn edit_body(&self, path: &str, body: &str) {
        let parsed = meta::parse(&self.read_file(path));
        let meta = parsed.meta.expect("tracked file has metadata");
        self.write_file(path, &meta::serialize(&meta, body));
    }

    /// Stop the consumer and hand back the engine for assertions.
    async fn stop(self) -> (TempDir, Arc<InMemoryRemote>, SyncEngine) {
        // Let queued cycles drain before flipping shutdown
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.shutdown_tx.send(true).expect("consumer alive");
        let engine = timeout(Duration::from_secs(5), self.consumer)
            .await
            .expect("consumer stopped")
            .expect("consumer not panicked");
        (self.dir, self.remote, engine)
    }
}

// ============================================================================
// Local -> remote
// ============================================================================

#[tokio::test]
async fn test_new_local_file_is_pushed() {
    let harness = Harness::start();
    harness.write_file("guide.md", "# Guide\n\nFirst version.\n");
    harness.send_local("guide.md", ChangeKind::Created);

    let (_dir, remote, engine) = harness.stop().await;

    let record = engine.store().get_by_path("guide.md").expect("tracked");
    assert_eq!(record.sync_state, SyncState::Synced);
    let page = remote.get(&record.id).expect("created remotely");
    assert!(page.body.contains("<h1>Guide</h1>"));
    assert_eq!(page.version, 1);
}

#[tokio::test]
async fn test_burst_of_local_events_coalesces_into_one_push() {
    let harness = Harness::start();
    harness.write_file("busy.md", "content\n");

    harness.send_local("busy.md", ChangeKind::Created);
    // Editor save storms arrive as repeated change events
    harness.send_local("busy.md", ChangeKind::Changed);
    harness.send_local("busy.md", ChangeKind::Changed);
    harness.send_local("busy.md", ChangeKind::Changed);

    let (_dir, remote, engine) = harness.stop().await;

    let record = engine.store().get_by_path("busy.md").expect("tracked");
    // A single create cycle ran; nothing bumped the version afterwards
    assert_eq!(remote.get(&record.id).unwrap().version, 1);
    assert_eq!(record.remote_version, 1);
}

#[tokio::test]
async fn test_local_delete_propagates_to_remote() {
    let harness = Harness::start();
    harness.write_file("gone.md", "short lived\n");
    harness.send_local("gone.md", ChangeKind::Created);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let id = {
        // Peek at the stamped id before deleting
        let parsed = meta::parse(&harness.read_file("gone.md"));
        parsed.meta.unwrap().id.unwrap()
    };
    std::fs::remove_file(harness.dir.path().join("gone.md")).unwrap();
    harness.send_local("gone.md", ChangeKind::Deleted);

    let (_dir, remote, engine) = harness.stop().await;
    assert!(remote.get(&id).is_none());
    assert!(engine.store().get(&id).is_none());
}

// ============================================================================
// Remote -> local
// ============================================================================

#[tokio::test]
async fn test_remote_page_is_adopted_locally() {
    let harness = Harness::start();
    let page = harness
        .remote
        .create("Release Notes", None, "<h2>What changed</h2><p>Things.</p>")
        .await
        .unwrap();
    harness.send_remote(&page.id, ChangeKind::Created);

    let (dir, _remote, engine) = harness.stop().await;

    let record = engine.store().get(&page.id).expect("adopted");
    assert_eq!(record.path, "release-notes.md");
    let content = std::fs::read_to_string(dir.path().join(&record.path)).unwrap();
    assert!(content.contains("## What changed"));
    assert!(content.contains("Things."));
}

#[tokio::test]
async fn test_poller_feeds_remote_edits_through_the_queue() {
    let harness = Harness::start();
    let page = harness.remote.create("Doc", None, "<p>v1</p>").await.unwrap();

    let (poll_cursor_tx, _poll_cursor_rx) = mpsc::unbounded_channel();
    let mut poller = Poller::new(
        Arc::clone(&harness.remote) as Arc<dyn RemoteService>,
        PollScope::Collection("all".into()),
        Duration::from_secs(60),
        None,
        harness.event_tx.clone(),
        poll_cursor_tx,
    );

    poller.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    harness
        .remote
        .update(&page.id, "Doc", "<p>v2</p>", 1)
        .await
        .unwrap();
    poller.poll_once().await.unwrap();

    let (dir, _remote, engine) = harness.stop().await;
    let record = engine.store().get(&page.id).expect("tracked");
    assert_eq!(record.remote_version, 2);
    let content = std::fs::read_to_string(dir.path().join(&record.path)).unwrap();
    assert!(content.contains("v2"));
}

#[tokio::test]
async fn test_webhook_payload_triggers_a_pull() {
    let harness = Harness::start();
    let page = harness
        .remote
        .create("Webhooked", None, "<p>pushed from remote</p>")
        .await
        .unwrap();

    let (payload_tx, payload_rx) = mpsc::unbounded_channel();
    let source = WebhookSource::new(payload_rx, harness.event_tx.clone());
    let (_source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
    tokio::spawn(source.run(source_shutdown_rx));

    payload_tx
        .send(WebhookPayload {
            document_id: page.id.clone(),
            event: "page_created".into(),
        })
        .unwrap();

    let (dir, _remote, engine) = harness.stop().await;
    let record = engine.store().get(&page.id).expect("adopted via webhook");
    let content = std::fs::read_to_string(dir.path().join(&record.path)).unwrap();
    assert!(content.contains("pushed from remote"));
}

// ============================================================================
// Divergence
// ============================================================================

#[tokio::test]
async fn test_divergent_edits_end_in_marked_conflict_then_resolve() {
    let harness = Harness::start();
    harness.write_file("plan.md", "agenda\n");
    harness.send_local("plan.md", ChangeKind::Created);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let id = meta::parse(&harness.read_file("plan.md"))
        .meta
        .unwrap()
        .id
        .unwrap();

    // Both sides edit the same line
    harness
        .remote
        .update(&id, "plan", "<p>remote agenda</p>", 1)
        .await
        .unwrap();
    harness.edit_body("plan.md", "local agenda\n");
    harness.send_remote(&id, ChangeKind::Changed);

    let (dir, remote, mut engine) = harness.stop().await;

    let record = engine.store().get(&id).expect("tracked").clone();
    assert_eq!(record.sync_state, SyncState::Conflict);
    let marked = std::fs::read_to_string(dir.path().join("plan.md")).unwrap();
    assert!(has_conflict_markers(&marked));
    // base_hash pinned at the last completed sync
    assert_eq!(record.base_hash, content_hash("agenda\n"));

    // Operator keeps the local side
    engine.resolve(&id, Resolution::Local).await.unwrap();
    let record = engine.store().get(&id).unwrap();
    assert_eq!(record.sync_state, SyncState::Synced);
    assert!(remote.get(&id).unwrap().body.contains("local agenda"));
    let resolved = std::fs::read_to_string(dir.path().join("plan.md")).unwrap();
    assert!(!has_conflict_markers(&resolved));
}

#[tokio::test]
async fn test_disjoint_edits_merge_without_conflict() {
    let harness = Harness::start();
    harness.write_file("list.md", "alpha\n\nbravo\n\ncharlie\n");
    harness.send_local("list.md", ChangeKind::Created);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let id = meta::parse(&harness.read_file("list.md"))
        .meta
        .unwrap()
        .id
        .unwrap();

    harness
        .remote
        .update(
            &id,
            "list",
            "<p>alpha</p>\n<p>bravo</p>\n<p>charlie remote</p>",
            1,
        )
        .await
        .unwrap();
    harness.edit_body("list.md", "alpha local\n\nbravo\n\ncharlie\n");
    harness.send_remote(&id, ChangeKind::Changed);

    let (dir, remote, engine) = harness.stop().await;

    let record = engine.store().get(&id).expect("tracked");
    assert_eq!(record.sync_state, SyncState::Synced);
    let merged = std::fs::read_to_string(dir.path().join("list.md")).unwrap();
    assert!(merged.contains("alpha local"));
    assert!(merged.contains("charlie remote"));
    assert!(remote.get(&id).unwrap().body.contains("alpha local"));
}

// ============================================================================
// State persistence
// ============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let harness = Harness::start();
    harness.write_file("keep.md", "persisted\n");
    harness.send_local("keep.md", ChangeKind::Created);
    harness.cursor_tx.send("9".into()).unwrap();

    let (dir, remote, engine) = harness.stop().await;
    let id = engine.store().get_by_path("keep.md").unwrap().id.clone();
    drop(engine);

    // A fresh engine over the same tree picks up where the last left off
    let store = StateStore::open(dir.path()).unwrap();
    assert_eq!(store.poll_cursor(), Some("9"));
    let record = store.get(&id).expect("reloaded");
    assert_eq!(record.sync_state, SyncState::Synced);
    assert_eq!(record.path, "keep.md");
    assert!(remote.get(&id).is_some());
}
