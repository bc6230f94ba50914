//! pagesync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod arbitrator;
pub mod config;
pub mod engine;
pub mod http_remote;
pub mod lock;
pub mod poller;
pub mod watcher;
pub mod webhook;

// Re-export key types for convenience
pub use arbitrator::Arbitrator;
pub use config::Config;
pub use engine::SyncEngine;
pub use http_remote::HttpRemote;
pub use lock::SessionLock;
pub use poller::Poller;
pub use watcher::TreeWatcher;
pub use webhook::{WebhookPayload, WebhookSource};
