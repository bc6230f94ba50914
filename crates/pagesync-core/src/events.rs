//! Normalized change events.
//!
//! All three producers (filesystem watch, remote poll, webhook push)
//! reduce their notifications to this one shape before anything enters
//! the arbitrator queue. Origin is carried for debounce policy and
//! logging only; it never affects merge semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which producer observed the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Local,
    Remote,
    Webhook,
}

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    Moved,
}

/// Reference to the document a change applies to. Local creations have
/// no remote id yet; remote notifications may not know the local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Remote identifier, when known.
    pub id: Option<String>,
    /// Path relative to the synced tree root, when known.
    pub path: Option<String>,
}

impl DocumentRef {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            path: None,
        }
    }

    pub fn by_path(path: impl Into<String>) -> Self {
        Self {
            id: None,
            path: Some(path.into()),
        }
    }

    /// Stable key for per-document serialization: the remote id when
    /// known, otherwise the local path.
    pub fn key(&self) -> String {
        self.id
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_default()
    }
}

/// One normalized change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub document: DocumentRef,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(origin: ChangeOrigin, document: DocumentRef, kind: ChangeKind) -> Self {
        Self {
            origin,
            document,
            kind,
            observed_at: Utc::now(),
        }
    }
}
