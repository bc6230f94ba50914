//! pagesync-core: bidirectional sync engine between a local markdown tree
//! and a remote versioned document service.
//!
//! This crate provides the core machinery:
//! - Content normalization and change-detection hashing
//! - Lossless markdown ↔ rich storage-format conversion, macro-aware
//! - Three-way line merge with explicit conflict surfacing
//! - Per-document sync-state tracking over the base/local/remote hash triple
//! - The normalized change-event shape shared by all producers
//! - The `RemoteService` trait and the persisted state store

pub mod convert;
pub mod error;
pub mod events;
pub mod merge;
pub mod meta;
pub mod normalize;
pub mod remote;
pub mod state;
pub mod store;

pub use error::{Result, SyncError};
pub use events::{ChangeEvent, ChangeKind, ChangeOrigin, DocumentRef};
pub use merge::{
    has_conflict_markers, parse_conflict_markers, resolve_conflicts, three_way_merge,
    ConflictRegion, ConflictSide, MergeOutcome,
};
pub use normalize::{content_hash, normalize};
pub use remote::{ChangedSince, PollScope, RemotePage, RemoteService};
pub use state::{DocumentRecord, Resolution, SyncState, Transition};
pub use store::{DeletedSide, StateStore, Tombstone};
