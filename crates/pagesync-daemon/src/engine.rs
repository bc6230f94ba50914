//! Per-document sync cycle.
//!
//! The engine is invoked only from the arbitrator's serialized consumer.
//! One call covers one document: read both sides, run the state-tracker
//! transition, merge when both sides diverged, and write back. The hash
//! triple and the base snapshot move only here, after validated
//! reads/writes.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use pagesync_core::error::SyncError;
use pagesync_core::state::{self, DocumentRecord, Resolution, Transition};
use pagesync_core::store::{DeletedSide, StateStore, STATE_DIR};
use pagesync_core::{
    content_hash, convert, has_conflict_markers, meta, ChangeEvent, ChangeKind, ChangeOrigin,
    RemotePage, RemoteService, SyncState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SyncEngine {
    tree_root: PathBuf,
    remote: Arc<dyn RemoteService>,
    store: StateStore,
    fetch_concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        tree_root: PathBuf,
        remote: Arc<dyn RemoteService>,
        store: StateStore,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            tree_root,
            remote,
            store,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StateStore {
        &mut self.store
    }

    fn abs(&self, relative: &str) -> PathBuf {
        self.tree_root.join(relative)
    }

    /// Base-content snapshot location for a document. The snapshot is
    /// what `three_way_merge` uses as its ancestor; `base_hash` in the
    /// record is its fingerprint.
    fn base_path(&self, id: &str) -> PathBuf {
        self.tree_root
            .join(STATE_DIR)
            .join("base")
            .join(format!("{}.md", id))
    }

    fn read_base(&self, id: &str) -> Option<String> {
        std::fs::read_to_string(self.base_path(id)).ok()
    }

    fn write_base(&self, id: &str, content: &str) -> Result<()> {
        let path = self.base_path(id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(())
    }

    fn remove_base(&self, id: &str) {
        let _ = std::fs::remove_file(self.base_path(id));
    }

    /// Process one normalized change event. Origin never affects merge
    /// semantics; it only picks how the document is located.
    pub async fn process(&mut self, event: &ChangeEvent) -> Result<()> {
        debug!(
            "Processing {:?} event for {} (origin {:?})",
            event.kind,
            event.document.key(),
            event.origin
        );

        match (event.origin, event.kind) {
            (ChangeOrigin::Local, ChangeKind::Deleted) => {
                if let Some(path) = event.document.path.as_deref() {
                    self.on_local_deleted(path).await?;
                }
                Ok(())
            }
            (_, ChangeKind::Deleted) => {
                if let Some(id) = event.document.id.as_deref() {
                    self.on_remote_deleted(id).await?;
                }
                Ok(())
            }
            _ => self.reconcile_ref(event).await,
        }
    }

    async fn reconcile_ref(&mut self, event: &ChangeEvent) -> Result<()> {
        // Resolve to a tracked record or a local path
        if let Some(id) = event.document.id.as_deref() {
            let id = id.to_string();
            return self.reconcile_id(&id).await;
        }
        if let Some(path) = event.document.path.as_deref() {
            let path = path.to_string();
            return self.reconcile_path(&path).await;
        }
        Ok(())
    }

    /// Reconcile a document known by local path (watch events).
    pub async fn reconcile_path(&mut self, path: &str) -> Result<()> {
        let content = match std::fs::read_to_string(self.abs(path)) {
            Ok(content) => content,
            Err(_) => {
                // Raced with a delete; the delete event will follow
                return Ok(());
            }
        };
        let parsed = meta::parse(&content);

        let id = parsed
            .meta
            .as_ref()
            .and_then(|m| m.id.clone())
            .or_else(|| self.store.get_by_path(path).map(|r| r.id.clone()));

        match id {
            Some(id) => {
                if let Some(record) = self.store.get(&id) {
                    if record.path != path {
                        info!("Detected move: {} -> {}", record.path, path);
                        let mut moved = record.clone();
                        moved.path = path.to_string();
                        self.store.upsert(moved)?;
                    }
                }
                self.reconcile_id(&id).await
            }
            None => self.push_new_local(path, &parsed).await,
        }
    }

    /// First push of an untracked local file: create remotely, then stamp
    /// the id/version into the metadata block.
    async fn push_new_local(&mut self, path: &str, parsed: &meta::ParsedFile) -> Result<()> {
        let title = parsed
            .meta
            .as_ref()
            .map(|m| m.title.clone())
            .unwrap_or_else(|| title_from_path(path));
        let parent_id = self.parent_id_for(path);

        let storage = convert::to_storage(&parsed.body);
        let page = self
            .remote
            .create(&title, parent_id.as_deref(), &storage)
            .await
            .with_context(|| format!("creating remote document for {}", path))?;

        info!("Created remote document {} for {}", page.id, path);

        let stamped = meta::serialize(
            &meta::DocumentMeta {
                id: Some(page.id.clone()),
                title: title.clone(),
                version: Some(page.version),
            },
            &parsed.body,
        );
        std::fs::write(self.abs(path), &stamped)?;

        let mut record = DocumentRecord::synced(
            page.id.clone(),
            path.to_string(),
            title,
            page.version,
            content_hash(&parsed.body),
        );
        record.parent_id = page.parent_id.clone();
        record.ancestor_chain = self.ancestors_of(page.parent_id.as_deref());
        self.write_base(&page.id, &parsed.body)?;
        self.store.upsert(record)?;
        Ok(())
    }

    /// Reconcile a tracked document by remote id: the state-table cycle.
    pub async fn reconcile_id(&mut self, id: &str) -> Result<()> {
        // A one-sided deletion recorded earlier is still pending; finish
        // it instead of reconciling content
        if let Some(side) = self.store.tombstone(id).map(|t| t.side) {
            return match side {
                DeletedSide::Local => self.finish_local_delete(id).await,
                DeletedSide::Remote => self.on_remote_deleted(id).await,
            };
        }

        let page = match self.remote.fetch(id).await {
            Ok(page) => page,
            Err(SyncError::RemoteNotFound(_)) => {
                return self.on_remote_deleted(id).await;
            }
            Err(e) => return Err(e.into()),
        };
        self.reconcile_fetched(page).await
    }

    /// The state-table cycle over an already-fetched page.
    async fn reconcile_fetched(&mut self, page: RemotePage) -> Result<()> {
        let Some(record) = self.store.get(&page.id).cloned() else {
            return self.adopt_fetched(page).await;
        };

        let local_path = self.abs(&record.path);
        let local = match std::fs::read_to_string(&local_path) {
            Ok(content) => content,
            Err(_) => {
                // Local file is gone; reconcile as a local deletion
                return self.on_local_deleted(&record.path).await;
            }
        };
        let parsed = meta::parse(&local);
        let local_body = parsed.body.clone();

        // An unresolved conflict holds until its markers are gone;
        // re-merging marked content would nest markers inside markers
        if record.sync_state == SyncState::Conflict && has_conflict_markers(&local_body) {
            debug!(
                "Document {} awaiting conflict resolution; skipping cycle",
                record.id
            );
            return Ok(());
        }

        let remote_body = convert::to_markdown(&page.body);
        let base = self.read_base(&record.id).unwrap_or_default();

        let transition = state::evaluate(&record.base_hash, &base, &local_body, &remote_body);
        self.apply_transition(record, &page, &local_body, &remote_body, transition)
            .await
    }

    /// A remote page we have no record for: pull it into the tree.
    async fn adopt_fetched(&mut self, page: RemotePage) -> Result<()> {
        let body = convert::to_markdown(&page.body);
        let path = self.path_for_new_page(&page);
        info!("Adopting remote document {} at {}", page.id, path);
        self.write_local(&path, &page, &body)?;

        let mut record = DocumentRecord::synced(
            page.id.clone(),
            path,
            page.title.clone(),
            page.version,
            content_hash(&body),
        );
        record.parent_id = page.parent_id.clone();
        record.ancestor_chain = self.ancestors_of(page.parent_id.as_deref());
        self.write_base(&page.id, &body)?;
        self.store.upsert(record)?;
        Ok(())
    }

    async fn apply_transition(
        &mut self,
        mut record: DocumentRecord,
        page: &RemotePage,
        local_body: &str,
        remote_body: &str,
        transition: Transition,
    ) -> Result<()> {
        record.parent_id = page.parent_id.clone();
        record.ancestor_chain = self.ancestors_of(page.parent_id.as_deref());

        match transition {
            Transition::InSync => {
                if record.sync_state != SyncState::Synced
                    || record.remote_version != page.version
                {
                    state::complete_sync(&mut record, local_body, page.version);
                    self.store.upsert(record)?;
                }
                Ok(())
            }
            Transition::PushLocal => {
                debug!("Pushing local edit of {} ({})", record.path, record.id);
                let storage = convert::to_storage(local_body);
                let updated = self
                    .remote
                    .update(&record.id, &record.title, &storage, page.version)
                    .await
                    .with_context(|| format!("pushing document {}", record.id))?;
                state::complete_sync(&mut record, local_body, updated.version);
                self.write_base(&record.id, local_body)?;
                self.write_local(&record.path.clone(), &updated, local_body)?;
                self.store.upsert(record)?;
                Ok(())
            }
            Transition::PullRemote => {
                debug!("Pulling remote edit of {} ({})", record.path, record.id);
                self.write_local(&record.path.clone(), page, remote_body)?;
                state::complete_sync(&mut record, remote_body, page.version);
                self.write_base(&record.id, remote_body)?;
                self.store.upsert(record)?;
                Ok(())
            }
            Transition::Merged { content } => {
                info!(
                    "Merged concurrent edits of {} cleanly",
                    record.path
                );
                let storage = convert::to_storage(&content);
                let updated = self
                    .remote
                    .update(&record.id, &record.title, &storage, page.version)
                    .await
                    .with_context(|| format!("pushing merge of {}", record.id))?;
                self.write_local(&record.path.clone(), &updated, &content)?;
                state::complete_sync(&mut record, &content, updated.version);
                self.write_base(&record.id, &content)?;
                self.store.upsert(record)?;
                Ok(())
            }
            Transition::ConflictMarked { outcome } => {
                warn!(
                    "Conflict in {}: {} region(s) surfaced for manual resolution",
                    record.path, outcome.conflict_count
                );
                self.write_local(&record.path.clone(), page, &outcome.content)?;
                state::mark_conflict(&mut record, &outcome.content, remote_body, page.version);
                self.store.upsert(record)?;
                Ok(())
            }
        }
    }

    /// Local file removed. Distinguish a move (the id lives on in a new
    /// file) from a real delete before touching the remote.
    async fn on_local_deleted(&mut self, path: &str) -> Result<()> {
        let Some(record) = self.store.get_by_path(path).cloned() else {
            return Ok(());
        };
        if self.abs(path).exists() {
            // The file came back within the debounce window
            return Ok(());
        }

        if let Some(new_path) = self.find_file_with_id(&record.id) {
            info!("Detected move: {} -> {}", path, new_path);
            let mut moved = record;
            moved.path = new_path;
            self.store.upsert(moved)?;
            return Ok(());
        }

        info!("Local delete of {} ({})", path, record.id);
        self.store
            .add_tombstone(&record.id, path, DeletedSide::Local)?;
        self.finish_local_delete(&record.id).await
    }

    /// Propagate a pending local deletion to the remote. On failure the
    /// tombstone and record stay put, so a later cycle retries.
    async fn finish_local_delete(&mut self, id: &str) -> Result<()> {
        match self.remote.delete(id).await {
            Ok(()) | Err(SyncError::RemoteNotFound(_)) => {
                // Both sides now agree the document is gone
                self.remove_base(id);
                self.store.remove(id)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remote reports the document gone.
    async fn on_remote_deleted(&mut self, id: &str) -> Result<()> {
        let Some(record) = self.store.get(id).cloned() else {
            return Ok(());
        };
        self.store
            .add_tombstone(id, &record.path, DeletedSide::Remote)?;

        let local_path = self.abs(&record.path);
        match std::fs::read_to_string(&local_path) {
            Err(_) => {
                // Nothing left locally either
            }
            Ok(content) if content_hash(&meta::parse(&content).body) == record.base_hash => {
                info!("Remote delete of {} ({}); removing local file", record.path, id);
                match std::fs::remove_file(&local_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    // Leave the tombstone and record in place so a later
                    // cycle retries the removal
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(content) => {
                // Local edits exist; keep the file, stripped of its dead
                // remote id, so the next local event pushes it as new
                warn!(
                    "Remote deleted {} but {} has local edits; keeping file untracked",
                    id, record.path
                );
                let parsed = meta::parse(&content);
                let stripped = meta::serialize(
                    &meta::DocumentMeta {
                        id: None,
                        title: record.title.clone(),
                        version: None,
                    },
                    &parsed.body,
                );
                std::fs::write(&local_path, stripped)?;
            }
        }
        self.remove_base(id);
        self.store.remove(id)?;
        Ok(())
    }

    /// Apply an explicit conflict resolution and complete the sync.
    pub async fn resolve(&mut self, id: &str, resolution: Resolution) -> Result<()> {
        let Some(record) = self.store.get(id).cloned() else {
            anyhow::bail!("no tracked document with id {}", id);
        };
        let content = std::fs::read_to_string(self.abs(&record.path))?;
        let parsed = meta::parse(&content);

        let Some(resolved) = state::apply_resolution(&parsed.body, resolution) else {
            anyhow::bail!(
                "document {} still contains conflict markers; resolve them first",
                id
            );
        };

        let page = self.remote.fetch(id).await?;
        let storage = convert::to_storage(&resolved);
        let updated = self
            .remote
            .update(id, &record.title, &storage, page.version)
            .await?;

        let mut record = record;
        self.write_local(&record.path.clone(), &updated, &resolved)?;
        state::complete_sync(&mut record, &resolved, updated.version);
        self.write_base(id, &resolved)?;
        self.store.upsert(record)?;
        info!("Resolved conflict on {} ({:?})", id, resolution);
        Ok(())
    }

    /// Startup pass: reconcile every tracked document. Remote point
    /// fetches run with bounded concurrency; the write-back cycle stays
    /// serialized.
    pub async fn reconcile_all(&mut self) -> Result<()> {
        let ids: Vec<String> = self.store.all().iter().map(|r| r.id.clone()).collect();
        info!("Startup reconcile of {} tracked document(s)", ids.len());

        // Fetch concurrently, then feed each page into the serialized
        // per-document cycle; each document is fetched exactly once.
        let remote = Arc::clone(&self.remote);
        let concurrency = self.fetch_concurrency;
        let fetched: Vec<(String, std::result::Result<RemotePage, SyncError>)> =
            stream::iter(ids)
                .map(|id| {
                    let remote = Arc::clone(&remote);
                    async move {
                        let page = remote.fetch(&id).await;
                        (id, page)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        for (id, result) in fetched {
            let outcome = if self.store.tombstone(&id).is_some() {
                // A pending one-sided deletion takes precedence over
                // whatever the fetch returned
                self.reconcile_id(&id).await
            } else {
                match result {
                    Ok(page) => self.reconcile_fetched(page).await,
                    Err(SyncError::RemoteNotFound(_)) => self.on_remote_deleted(&id).await,
                    Err(e) => Err(e.into()),
                }
            };
            if let Err(e) = outcome {
                warn!("Startup reconcile of {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    fn write_local(&self, path: &str, page: &RemotePage, body: &str) -> Result<()> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = meta::serialize(
            &meta::DocumentMeta {
                id: Some(page.id.clone()),
                title: page.title.clone(),
                version: Some(page.version),
            },
            body,
        );
        std::fs::write(&abs, content)?;
        Ok(())
    }

    /// Tree scan for a file whose metadata block carries `id`.
    fn find_file_with_id(&self, id: &str) -> Option<String> {
        let mut stack = vec![self.tree_root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir).ok()?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if path.file_name().and_then(|n| n.to_str()) != Some(STATE_DIR) {
                        stack.push(path);
                    }
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue;
                };
                if meta::parse(&content)
                    .meta
                    .and_then(|m| m.id)
                    .as_deref()
                    == Some(id)
                {
                    return path
                        .strip_prefix(&self.tree_root)
                        .ok()
                        .and_then(|p| p.to_str())
                        .map(String::from);
                }
            }
        }
        None
    }

    /// Place a newly adopted remote page under its parent's directory
    /// when the parent is a local container, otherwise at the tree root.
    fn path_for_new_page(&self, page: &RemotePage) -> String {
        let file = format!("{}.md", slug(&page.title));
        if let Some(parent_id) = page.parent_id.as_deref() {
            if let Some(parent) = self.store.get(parent_id) {
                if let Some(dir) = parent.path.strip_suffix(meta::FOLDER_MARKER) {
                    return format!("{}{}", dir, file);
                }
                if let Some(dir) = Path::new(&parent.path).parent().and_then(|p| p.to_str()) {
                    if !dir.is_empty() {
                        return format!("{}/{}", dir, file);
                    }
                }
            }
        }
        file
    }

    /// Parent id of a new local file, from its directory's marker file.
    fn parent_id_for(&self, path: &str) -> Option<String> {
        let dir = Path::new(path).parent()?.to_str()?;
        if dir.is_empty() {
            return None;
        }
        let marker = format!("{}/{}", dir, meta::FOLDER_MARKER);
        self.store.get_by_path(&marker).map(|r| r.id.clone())
    }

    /// Remote ancestors, root first, built from tracked parent records.
    fn ancestors_of(&self, parent_id: Option<&str>) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = parent_id.map(String::from);
        while let Some(id) = cursor {
            if chain.contains(&id) {
                break;
            }
            chain.push(id.clone());
            cursor = self.store.get(&id).and_then(|r| r.parent_id.clone());
        }
        chain.reverse();
        chain
    }
}

fn title_from_path(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .replace(['-', '_'], " ")
}

fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            if !out.ends_with('-') {
                out.push('-');
            }
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}
