//! pagesync-daemon: keeps a local markdown tree and a remote versioned
//! document service in sync.
//!
//! Three producers (filesystem watch, remote poll, webhook push) feed one
//! arbitrated queue; a single consumer runs the per-document sync cycle.

use anyhow::{bail, Result};
use clap::Parser;
use pagesync_core::{PollScope, RemoteService, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pagesync_daemon::{
    webhook, Arbitrator, Config, HttpRemote, Poller, SessionLock, SyncEngine, TreeWatcher,
    WebhookSource,
};

#[derive(Parser, Debug)]
#[command(name = "pagesync-daemon")]
#[command(about = "Bidirectional markdown <-> document service sync daemon")]
struct Args {
    /// Path to the local synced tree
    #[arg(short, long)]
    tree: PathBuf,

    /// Poll a single document by remote id
    #[arg(long, conflicts_with_all = ["subtree", "collection"])]
    document: Option<String>,

    /// Poll a page and all of its descendants
    #[arg(long, conflicts_with = "collection")]
    subtree: Option<String>,

    /// Poll a whole collection
    #[arg(long)]
    collection: Option<String>,

    /// Seconds between remote polls
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Address for webhook deliveries (disabled when absent)
    #[arg(long)]
    webhook_listen: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn scope(&self) -> Result<PollScope> {
        match (&self.document, &self.subtree, &self.collection) {
            (Some(id), _, _) => Ok(PollScope::Document(id.clone())),
            (_, Some(id), _) => Ok(PollScope::Subtree(id.clone())),
            (_, _, Some(id)) => Ok(PollScope::Collection(id.clone())),
            _ => bail!("one of --document, --subtree or --collection is required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,pagesync_daemon=debug"
    } else {
        "info,pagesync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let scope = args.scope()?;
    let config = Config::from_env(args.tree.clone(), scope, args.poll_interval)?;

    info!("Starting pagesync-daemon");
    info!("Tree root: {:?}", config.tree_root);
    info!("Remote: {}", config.base_url);
    info!("Poll scope: {:?}", config.poll_scope);

    // Held for the whole session; released (and removed) on exit
    let session_lock = SessionLock::acquire(&config.tree_root)?;

    // A corrupt store refuses to open rather than guess at prior state
    let store = StateStore::open(&config.tree_root)?;
    let initial_cursor = store.poll_cursor().map(String::from);

    let remote: Arc<dyn RemoteService> = Arc::new(HttpRemote::new(
        config.base_url.clone(),
        config.token.clone(),
        config.max_retries,
    )?);

    let mut engine = SyncEngine::new(
        config.tree_root.clone(),
        Arc::clone(&remote),
        store,
        config.fetch_concurrency,
    );
    engine.reconcile_all().await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cursor_tx, cursor_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Remote poll producer
    let poller = Poller::new(
        Arc::clone(&remote),
        config.poll_scope.clone(),
        config.poll_interval,
        initial_cursor,
        event_tx.clone(),
        cursor_tx,
    );
    tokio::spawn(poller.run(shutdown_rx.clone()));

    // Webhook push producer (optional)
    if let Some(addr) = args.webhook_listen.clone() {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let source = WebhookSource::new(payload_rx, event_tx.clone());
        tokio::spawn(source.run(shutdown_rx.clone()));
        let listener_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = webhook::listen(&addr, payload_tx, listener_shutdown).await {
                error!("Webhook listener failed: {}", e);
            }
        });
    }

    // Local filesystem watch producer
    let mut tree_watcher = TreeWatcher::new(config.tree_root.clone())?;
    info!("File watcher started");

    // The serialized consumer
    let arbitrator = Arbitrator::new(engine, event_rx, cursor_rx, config.debounce_window);
    let consumer = tokio::spawn(arbitrator.run(shutdown_rx));

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = tree_watcher.event_rx().recv() => {
                let _ = event_tx.send(event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Let the cycle in flight finish before releasing the lock
    let _ = shutdown_tx.send(true);
    match consumer.await {
        Ok(_engine) => {}
        Err(e) => error!("Consumer task failed: {}", e),
    }

    drop(session_lock);
    info!("Shutting down");
    Ok(())
}
