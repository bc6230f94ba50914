//! Local filesystem watch producer.
//!
//! Uses notify-debouncer-mini for efficient change detection, normalizing
//! everything into the shared `ChangeEvent` shape before it reaches the
//! arbitrator queue.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use pagesync_core::store::STATE_DIR;
use pagesync_core::{ChangeEvent, ChangeKind, ChangeOrigin, DocumentRef};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Paths already observed, so a first observation maps to `Created`
/// rather than `Changed`. Renames arrive as a delete plus a create.
type SeenPaths = Arc<Mutex<HashSet<String>>>;

/// Watches the synced tree and emits normalized change events.
pub struct TreeWatcher {
    tree_root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl TreeWatcher {
    /// Start watching `tree_root` recursively.
    ///
    /// Uses a 200ms debounce period to avoid rapid-fire events during
    /// saves; a longer coalescing window is applied again in the
    /// arbitrator.
    pub fn new(tree_root: PathBuf) -> Result<Self> {
        // Resolve symlinks; macOS FSEvents needs the real path
        let tree_root = tree_root.canonicalize().unwrap_or(tree_root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = tree_root.clone();

        let seen: SeenPaths = Arc::new(Mutex::new(scan_tree(&tree_root)));
        let seen_clone = Arc::clone(&seen);

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) =
                            process_event(&event, &root_clone, &seen_clone)
                        {
                            if event_tx.send(change).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&tree_root, RecursiveMode::Recursive)?;

        Ok(Self {
            tree_root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Receiver for normalized change events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<ChangeEvent> {
        &mut self.event_rx
    }

    pub fn tree_root(&self) -> &Path {
        &self.tree_root
    }
}

/// Initial scan so pre-existing files count as already seen.
fn scan_tree(root: &Path) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) != Some(STATE_DIR) {
                    stack.push(path);
                }
            } else if let Some(relative) = relative_managed_path(&path, root) {
                seen.insert(relative);
            }
        }
    }
    seen
}

/// Map one debounced event to a normalized change event, if it concerns
/// a managed file.
fn process_event(event: &DebouncedEvent, root: &Path, seen: &SeenPaths) -> Option<ChangeEvent> {
    let relative = relative_managed_path(&event.path, root)?;

    let exists = event.path.exists();
    let kind = {
        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        if exists {
            if seen.insert(relative.clone()) {
                ChangeKind::Created
            } else {
                ChangeKind::Changed
            }
        } else {
            if !seen.remove(&relative) {
                // Never tracked; nothing to reconcile
                return None;
            }
            ChangeKind::Deleted
        }
    };

    debug!("Local file event: {:?} - {}", kind, relative);
    Some(ChangeEvent::new(
        ChangeOrigin::Local,
        DocumentRef::by_path(relative),
        kind,
    ))
}

/// Relative path of a managed file, or None for anything the engine
/// ignores (bookkeeping dir, hidden files, non-markdown).
fn relative_managed_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let relative_str = relative.to_str()?;

    if relative_str.is_empty() {
        return None;
    }
    // Skip the engine's own bookkeeping directory
    if relative_str.starts_with(STATE_DIR) {
        return None;
    }
    // Skip hidden files and directories
    if relative_str.starts_with('.') || relative_str.contains("/.") {
        return None;
    }
    if !relative_str.ends_with(".md") {
        return None;
    }
    Some(relative_str.to_string())
}
