//! Persisted state store: the hash-triple records and deletion tombstones.
//!
//! Stored as pretty JSON in `.pagesync/state.json` inside the synced
//! tree. The store is the only shared mutable resource across producers
//! and is written exclusively by the state tracker inside the serialized
//! consumer. An unreadable store file is `CorruptState`: the engine
//! refuses to start rather than guess at prior state.

use crate::error::{Result, SyncError};
use crate::state::DocumentRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory holding engine bookkeeping inside the synced tree.
pub const STATE_DIR: &str = ".pagesync";
const STATE_FILE: &str = "state.json";

/// Which side deleted a document first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedSide {
    Local,
    Remote,
}

/// Bookkeeping kept after one side deletes a document, so the engine can
/// tell "just removed" apart from "never existed" while reconciling the
/// other side. Dropped once both sides agree the document is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub path: String,
    pub side: DeletedSide,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    documents: Vec<DocumentRecord>,
    #[serde(default)]
    tombstones: Vec<Tombstone>,
    /// Last changed-since cursor acknowledged by the poller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    poll_cursor: Option<String>,
}

/// File-backed store for document records and tombstones.
pub struct StateStore {
    path: PathBuf,
    state: PersistedState,
}

impl StateStore {
    /// Open (or initialize) the store under `tree_root`.
    ///
    /// A present-but-unreadable file is a hard error.
    pub fn open(tree_root: &Path) -> Result<Self> {
        let path = tree_root.join(STATE_DIR).join(STATE_FILE);
        let state = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| SyncError::CorruptState(format!("{}: {}", path.display(), e)))?
        } else {
            PersistedState::default()
        };
        debug!(
            "Opened state store at {} ({} document(s))",
            path.display(),
            state.documents.len()
        );
        Ok(Self { path, state })
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.state)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }

    /// Point lookup by remote id.
    pub fn get(&self, id: &str) -> Option<&DocumentRecord> {
        self.state.documents.iter().find(|d| d.id == id)
    }

    /// Lookup by local path.
    pub fn get_by_path(&self, path: &str) -> Option<&DocumentRecord> {
        self.state.documents.iter().find(|d| d.path == path)
    }

    /// Full scan of all tracked documents.
    pub fn all(&self) -> &[DocumentRecord] {
        &self.state.documents
    }

    /// Insert or replace a record and persist.
    pub fn upsert(&mut self, record: DocumentRecord) -> Result<()> {
        if let Some(existing) = self.state.documents.iter_mut().find(|d| d.id == record.id) {
            *existing = record;
        } else {
            self.state.documents.push(record);
        }
        self.save()
    }

    /// Remove a record (document fully gone on both sides) and persist.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        self.state.documents.retain(|d| d.id != id);
        self.state.tombstones.retain(|t| t.id != id);
        self.save()
    }

    /// Record a one-sided deletion, keeping the document record until the
    /// other side acknowledges.
    pub fn add_tombstone(&mut self, id: &str, path: &str, side: DeletedSide) -> Result<()> {
        if self.state.tombstones.iter().any(|t| t.id == id) {
            return Ok(());
        }
        self.state.tombstones.push(Tombstone {
            id: id.to_string(),
            path: path.to_string(),
            side,
            observed_at: Utc::now(),
        });
        self.save()
    }

    pub fn tombstone(&self, id: &str) -> Option<&Tombstone> {
        self.state.tombstones.iter().find(|t| t.id == id)
    }

    pub fn poll_cursor(&self) -> Option<&str> {
        self.state.poll_cursor.as_deref()
    }

    pub fn set_poll_cursor(&mut self, cursor: String) -> Result<()> {
        self.state.poll_cursor = Some(cursor);
        self.save()
    }
}
