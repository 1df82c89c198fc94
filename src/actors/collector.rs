//! CollectorWatcher - Tracks the live collector set
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → list_collectors (retry) → changed? → watch::Sender<CollectorSet> → [PartitionWorker, ...]
//!     ↑
//!     └─── Commands (PollNow, Shutdown)
//! ```
//!
//! A failed poll keeps the previous snapshot: an unreachable store never
//! looks like every collector went away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, trace, warn};

use crate::CollectorSet;
use crate::retry::{BackoffPolicy, retry_with_backoff};
use crate::store::UveStore;

use super::messages::WatcherCommand;

/// Actor that polls the UVE store for live collectors
pub struct CollectorWatcher {
    store: Arc<dyn UveStore>,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<WatcherCommand>,

    /// Latest live set, observed by partition workers
    collectors_tx: watch::Sender<CollectorSet>,

    interval_duration: Duration,
    retry: BackoffPolicy,
}

impl CollectorWatcher {
    pub fn new(
        store: Arc<dyn UveStore>,
        command_rx: mpsc::Receiver<WatcherCommand>,
        collectors_tx: watch::Sender<CollectorSet>,
        interval_duration: Duration,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            command_rx,
            collectors_tx,
            interval_duration,
            retry,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting collector watcher");

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!("failed to poll collectors, keeping previous set: {e:#}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        WatcherCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let _ = respond_to.send(self.poll().await);
                        }

                        WatcherCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("collector watcher stopped");
    }

    /// Fetch the live set and publish it if it changed
    async fn poll(&self) -> Result<CollectorSet> {
        let collectors = retry_with_backoff("list collectors", self.retry, || self.store.list_collectors())
            .await
            .context("failed to list collectors")?;

        let set: CollectorSet = collectors
            .into_iter()
            .map(|info| (info.id, info.generation))
            .collect();

        let changed = self.collectors_tx.send_if_modified(|current| {
            if *current == set {
                return false;
            }
            *current = set.clone();
            true
        });

        if changed {
            info!("live collectors changed: {} collectors", set.len());
            trace!("live collectors: {set:?}");
        }
        Ok(set)
    }
}

/// Handle for controlling a CollectorWatcher
#[derive(Clone)]
pub struct CollectorWatcherHandle {
    sender: mpsc::Sender<WatcherCommand>,
    collectors_rx: watch::Receiver<CollectorSet>,
}

impl CollectorWatcherHandle {
    /// Spawn a new watcher polling every `poll_interval`
    pub fn spawn(store: Arc<dyn UveStore>, poll_interval: Duration, retry: BackoffPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (collectors_tx, collectors_rx) = watch::channel(CollectorSet::new());

        let actor = CollectorWatcher::new(store, cmd_rx, collectors_tx, poll_interval, retry);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            collectors_rx,
        }
    }

    /// Receiver of live-set updates
    pub fn subscribe(&self) -> watch::Receiver<CollectorSet> {
        self.collectors_rx.clone()
    }

    /// Last published live set
    pub fn current(&self) -> CollectorSet {
        self.collectors_rx.borrow().clone()
    }

    /// Poll the store immediately and return the live set
    pub async fn poll_now(&self) -> Result<CollectorSet> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WatcherCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(WatcherCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
