//! Webhook push producer.
//!
//! HTTP serving and transport-level signature verification belong to an
//! external collaborator; this engine accepts already-verified payloads
//! on a channel and normalizes them into the shared `ChangeEvent` shape.

use anyhow::Result;
use pagesync_core::{ChangeEvent, ChangeKind, ChangeOrigin, DocumentRef};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Payload delivered by the webhook collaborator after verification.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    /// Remote document id the notification concerns.
    pub document_id: String,
    /// Remote event name, e.g. "page_created", "page_updated",
    /// "page_removed", "page_moved".
    pub event: String,
}

impl WebhookPayload {
    /// Map the remote event name onto the normalized change kind.
    fn change_kind(&self) -> Option<ChangeKind> {
        match self.event.as_str() {
            "page_created" => Some(ChangeKind::Created),
            "page_updated" => Some(ChangeKind::Changed),
            "page_removed" => Some(ChangeKind::Deleted),
            "page_moved" => Some(ChangeKind::Moved),
            _ => None,
        }
    }
}

/// Drains verified webhook payloads and feeds the arbitrator queue.
pub struct WebhookSource {
    payload_rx: mpsc::UnboundedReceiver<WebhookPayload>,
    event_tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl WebhookSource {
    pub fn new(
        payload_rx: mpsc::UnboundedReceiver<WebhookPayload>,
        event_tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        Self {
            payload_rx,
            event_tx,
        }
    }

    /// Normalize payloads until the channel closes or shutdown flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                payload = self.payload_rx.recv() => {
                    match payload {
                        Some(payload) => self.handle(payload),
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    info!("Webhook source stopping");
                    return;
                }
            }
        }
    }

    fn handle(&self, payload: WebhookPayload) {
        let Some(kind) = payload.change_kind() else {
            warn!("Ignoring unknown webhook event {:?}", payload.event);
            return;
        };
        debug!("Webhook event: {:?} - {}", kind, payload.document_id);
        let event = ChangeEvent::new(
            ChangeOrigin::Webhook,
            DocumentRef::by_id(payload.document_id),
            kind,
        );
        let _ = self.event_tx.send(event);
    }
}

/// Accept webhook deliveries on a local TCP port, one JSON payload per
/// line. The verifying reverse proxy in front of the daemon is expected
/// to have authenticated the remote service already.
pub async fn listen(
    addr: &str,
    payload_tx: mpsc::UnboundedSender<WebhookPayload>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Webhook listener on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                debug!("Webhook connection from {}", peer);
                let tx = payload_tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        match serde_json::from_str::<WebhookPayload>(&line) {
                            Ok(payload) => {
                                if tx.send(payload).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Malformed webhook payload: {}", e),
                        }
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("Webhook listener stopping");
                return Ok(());
            }
        }
    }
}
