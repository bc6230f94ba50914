//! Change arbitrator: the single serialized consumer.
//!
//! Every producer (filesystem watch, remote poll, webhook push) feeds the
//! same unbounded queue of normalized change events. One consumer task
//! drains it in arrival order and runs one sync cycle at a time, so two
//! cycles never interleave for the same document; an event arriving while
//! a cycle is in flight simply waits in the queue. Rapid repeated events
//! for the same document within the coalescing window collapse into one
//! cycle before any remote traffic happens.

use crate::engine::SyncEngine;
use pagesync_core::{ChangeEvent, ChangeKind};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct Arbitrator {
    engine: SyncEngine,
    event_rx: mpsc::UnboundedReceiver<ChangeEvent>,
    /// Changed-since cursor advances reported by the poller, persisted
    /// here so the store only ever has one writer.
    cursor_rx: mpsc::UnboundedReceiver<String>,
    coalesce_window: Duration,
}

impl Arbitrator {
    pub fn new(
        engine: SyncEngine,
        event_rx: mpsc::UnboundedReceiver<ChangeEvent>,
        cursor_rx: mpsc::UnboundedReceiver<String>,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            engine,
            event_rx,
            cursor_rx,
            coalesce_window,
        }
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine {
        &mut self.engine
    }

    /// Drain events until shutdown flips or every producer hangs up. The
    /// cycle in flight when shutdown arrives always runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SyncEngine {
        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        info!("Event queue closed; arbitrator stopping");
                        return self.engine;
                    };
                    let batch = self.collect_batch(event).await;
                    for event in batch {
                        if let Err(e) = self.engine.process(&event).await {
                            error!(
                                "Sync cycle for {} failed: {:#}",
                                event.document.key(),
                                e
                            );
                        }
                    }
                }
                cursor = self.cursor_rx.recv() => {
                    if let Some(cursor) = cursor {
                        if let Err(e) = self.engine.store_mut().set_poll_cursor(cursor) {
                            warn!("Failed to persist poll cursor: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Arbitrator stopping");
                    return self.engine;
                }
            }
        }
    }

    /// Gather everything that arrives within the coalescing window after
    /// `first`, collapsing same-document events. Distinct documents keep
    /// their arrival order.
    async fn collect_batch(&mut self, first: ChangeEvent) -> Vec<ChangeEvent> {
        let mut order = vec![first.document.key()];
        let mut by_key: HashMap<String, ChangeEvent> = HashMap::new();
        by_key.insert(first.document.key(), first);

        let window = tokio::time::sleep(self.coalesce_window);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    let key = event.document.key();
                    match by_key.entry(key.clone()) {
                        Entry::Occupied(mut occupied) => {
                            let kind = coalesce(occupied.get().kind, event.kind);
                            debug!(
                                "Coalesced {:?} + {:?} -> {:?} for {}",
                                occupied.get().kind, event.kind, kind, key
                            );
                            let mut merged = event;
                            merged.kind = kind;
                            occupied.insert(merged);
                        }
                        Entry::Vacant(vacant) => {
                            order.push(key);
                            vacant.insert(event);
                        }
                    }
                }
            }
        }

        order
            .into_iter()
            .filter_map(|key| by_key.remove(&key))
            .collect()
    }
}

/// Collapse two consecutive kinds observed for one document.
fn coalesce(first: ChangeKind, second: ChangeKind) -> ChangeKind {
    match (first, second) {
        // A delete always wins, whatever preceded it
        (_, ChangeKind::Deleted) => ChangeKind::Deleted,
        // Deleted then recreated within the window: content changed
        (ChangeKind::Deleted, ChangeKind::Created) => ChangeKind::Changed,
        // A creation followed by edits still needs the creation path
        (ChangeKind::Created, _) => ChangeKind::Created,
        (_, kind) => kind,
    }
}
