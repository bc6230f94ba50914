//! Per-document sync state derived from the base/local/remote hash triple.
//!
//! The tracker owns every transition of the hash triple. Producers never
//! touch it; mutation happens only inside the serialized consumer after a
//! validated read or write.

use crate::merge::{self, ConflictSide, MergeOutcome};
use crate::normalize::content_hash;
use serde::{Deserialize, Serialize};

/// Sync state of one document.
///
/// `Conflict` is terminal-but-revisable: it persists until a resolution
/// strategy is applied, and is never treated as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// No remote id yet.
    Untracked,
    Synced,
    LocalModified,
    RemoteModified,
    Conflict,
}

/// Persisted record for one tracked document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Remote identifier, stable across renames.
    pub id: String,
    /// Local path relative to the synced tree root.
    pub path: String,
    pub title: String,
    /// Monotonic version number from the remote service.
    pub remote_version: u64,
    pub sync_state: SyncState,
    pub local_hash: String,
    pub remote_hash: String,
    /// Hash of content at the last successfully completed sync. Advanced
    /// only when a sync finishes without residual conflict markers.
    pub base_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Remote ancestors, root first, ending at the parent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestor_chain: Vec<String>,
}

impl DocumentRecord {
    /// Record for a document observed for the first time after its first
    /// successful sync, with all three hashes at the synced content.
    pub fn synced(id: String, path: String, title: String, version: u64, hash: String) -> Self {
        Self {
            id,
            path,
            title,
            remote_version: version,
            sync_state: SyncState::Synced,
            local_hash: hash.clone(),
            remote_hash: hash.clone(),
            base_hash: hash,
            parent_id: None,
            ancestor_chain: Vec::new(),
        }
    }
}

/// How a surfaced conflict should be resolved. Applying a resolution is
/// an explicit caller action, never automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local side of every region.
    Local,
    /// Keep the remote side of every region.
    Remote,
    /// The caller edited the marked file by hand; accept it as-is once
    /// no markers remain.
    AcceptMerged,
}

/// What the state tracker decided for one observation cycle.
#[derive(Debug)]
pub enum Transition {
    /// Nothing changed on either side.
    InSync,
    /// Only local changed: push local content to the remote.
    PushLocal,
    /// Only remote changed: write remote content to the local file.
    PullRemote,
    /// Both changed; the merge ran automatically and came back clean.
    /// Write `content` to both sides.
    Merged { content: String },
    /// Both changed divergently. The marked content is persisted locally
    /// and the document stays in `Conflict` until resolved.
    ConflictMarked { outcome: MergeOutcome },
}

/// Evaluate the transition table for freshly observed local and remote
/// content against the record's `base_hash`, invoking the merge engine
/// when both sides changed.
pub fn evaluate(base_hash: &str, base: &str, local: &str, remote: &str) -> Transition {
    let local_changed = content_hash(local) != base_hash;
    let remote_changed = content_hash(remote) != base_hash;

    match (local_changed, remote_changed) {
        (false, false) => Transition::InSync,
        (true, false) => Transition::PushLocal,
        (false, true) => Transition::PullRemote,
        (true, true) => {
            let outcome = merge::three_way_merge(base, local, remote);
            if outcome.success {
                Transition::Merged {
                    content: outcome.content,
                }
            } else {
                Transition::ConflictMarked { outcome }
            }
        }
    }
}

/// State implied by a transition, before any write-back completes.
pub fn state_for(transition: &Transition) -> SyncState {
    match transition {
        Transition::InSync => SyncState::Synced,
        Transition::PushLocal => SyncState::LocalModified,
        Transition::PullRemote => SyncState::RemoteModified,
        Transition::Merged { .. } => SyncState::Synced,
        Transition::ConflictMarked { .. } => SyncState::Conflict,
    }
}

/// Advance the hash triple after a sync completed without residual
/// conflict markers. The only place `base_hash` moves.
pub fn complete_sync(record: &mut DocumentRecord, content: &str, remote_version: u64) {
    debug_assert!(!merge::has_conflict_markers(content));
    let hash = content_hash(content);
    record.local_hash = hash.clone();
    record.remote_hash = hash.clone();
    record.base_hash = hash;
    record.remote_version = remote_version;
    record.sync_state = SyncState::Synced;
}

/// Record a surfaced conflict: the marked content lives in the local
/// file, `base_hash` stays put.
pub fn mark_conflict(record: &mut DocumentRecord, local: &str, remote: &str, remote_version: u64) {
    record.local_hash = content_hash(local);
    record.remote_hash = content_hash(remote);
    record.remote_version = remote_version;
    record.sync_state = SyncState::Conflict;
}

/// Apply an explicit resolution strategy to marker-bearing content.
///
/// Returns the resolved content, or `None` when `AcceptMerged` was
/// requested but marker tokens are still present.
pub fn apply_resolution(marked: &str, resolution: Resolution) -> Option<String> {
    match resolution {
        Resolution::Local => Some(merge::resolve_conflicts(marked, ConflictSide::Local)),
        Resolution::Remote => Some(merge::resolve_conflicts(marked, ConflictSide::Remote)),
        Resolution::AcceptMerged => {
            if merge::has_conflict_markers(marked) {
                None
            } else {
                Some(marked.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> DocumentRecord {
        DocumentRecord::synced(
            "1".into(),
            "a.md".into(),
            "A".into(),
            1,
            content_hash("base\n"),
        )
    }

    #[test]
    fn test_neither_changed() {
        let t = evaluate(&content_hash("x\n"), "x\n", "x\n", "x\n");
        assert!(matches!(t, Transition::InSync));
        assert_eq!(state_for(&t), SyncState::Synced);
    }

    #[test]
    fn test_local_changed_only() {
        let t = evaluate(&content_hash("x\n"), "x\n", "x edited\n", "x\n");
        assert!(matches!(t, Transition::PushLocal));
        assert_eq!(state_for(&t), SyncState::LocalModified);
    }

    #[test]
    fn test_remote_changed_only() {
        let t = evaluate(&content_hash("x\n"), "x\n", "x\n", "x edited\n");
        assert!(matches!(t, Transition::PullRemote));
        assert_eq!(state_for(&t), SyncState::RemoteModified);
    }

    #[test]
    fn test_both_changed_identically_merges_clean() {
        let t = evaluate(&content_hash("x\n"), "x\n", "same edit\n", "same edit\n");
        match t {
            Transition::Merged { content } => assert_eq!(content, "same edit\n"),
            other => panic!("expected Merged, got {:?}", other),
        }
    }

    #[test]
    fn test_both_changed_divergently_conflicts() {
        let t = evaluate(&content_hash("x\n"), "x\n", "local\n", "remote\n");
        match &t {
            Transition::ConflictMarked { outcome } => {
                assert!(outcome.conflict_count >= 1);
            }
            other => panic!("expected ConflictMarked, got {:?}", other),
        }
        assert_eq!(state_for(&t), SyncState::Conflict);
    }

    #[test]
    fn test_formatting_noise_is_not_a_change() {
        let t = evaluate(&content_hash("x\n"), "x\n", "x   \r\n", "x\n");
        assert!(matches!(t, Transition::InSync));
    }

    #[test]
    fn test_complete_sync_advances_triple() {
        let mut record = base_record();
        complete_sync(&mut record, "merged\n", 5);
        let hash = content_hash("merged\n");
        assert_eq!(record.base_hash, hash);
        assert_eq!(record.local_hash, hash);
        assert_eq!(record.remote_hash, hash);
        assert_eq!(record.remote_version, 5);
        assert_eq!(record.sync_state, SyncState::Synced);
    }

    #[test]
    fn test_mark_conflict_keeps_base_hash() {
        let mut record = base_record();
        let original_base = record.base_hash.clone();
        mark_conflict(&mut record, "local\n", "remote\n", 9);
        assert_eq!(record.base_hash, original_base);
        assert_eq!(record.sync_state, SyncState::Conflict);
        assert_eq!(record.remote_version, 9);
    }

    #[test]
    fn test_accept_merged_rejects_residual_markers() {
        let marked = "<<<<<<< LOCAL\na\n=======\nb\n>>>>>>> REMOTE\n";
        assert!(apply_resolution(marked, Resolution::AcceptMerged).is_none());
        assert!(apply_resolution("clean\n", Resolution::AcceptMerged).is_some());
    }

    #[test]
    fn test_resolution_local_strips_markers() {
        let marked = "keep\n<<<<<<< LOCAL\nours\n=======\ntheirs\n>>>>>>> REMOTE\n";
        let resolved = apply_resolution(marked, Resolution::Local).unwrap();
        assert_eq!(resolved, "keep\nours\n");
    }
}
