//! PartitionManager - Reconciles owned partitions with running workers
//!
//! Applies every `OwnershipEvent::Owned` before acknowledging it:
//!
//! 1. Each released partition's worker is stopped (it drains the batch in
//!    hand and drops the partition from the cache).
//! 2. The alarm actor tears down the alarms of the dropped keys.
//! 3. Workers are spawned for newly owned partitions.
//!
//! `OwnershipEvent::Fatal` stops every worker and raises the fatal flag the
//! binary waits on.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use super::alarm::AlarmHandle;
use super::messages::{ManagerCommand, OwnershipEvent, PartitionStatus};
use super::partition::{PartitionContext, PartitionHandle};

pub struct PartitionManager {
    ctx: PartitionContext,
    alarm: AlarmHandle,
    workers: BTreeMap<u32, PartitionHandle>,

    command_rx: mpsc::Receiver<ManagerCommand>,
    event_rx: mpsc::Receiver<OwnershipEvent>,

    /// Reason of a fatal coordination failure
    fatal_tx: watch::Sender<Option<String>>,
}

impl PartitionManager {
    pub fn new(
        ctx: PartitionContext,
        alarm: AlarmHandle,
        command_rx: mpsc::Receiver<ManagerCommand>,
        event_rx: mpsc::Receiver<OwnershipEvent>,
        fatal_tx: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            ctx,
            alarm,
            workers: BTreeMap::new(),
            command_rx,
            event_rx,
            fatal_tx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting partition manager");

        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    match event {
                        OwnershipEvent::Owned { partitions, ack } => {
                            self.reconcile(partitions).await;
                            let _ = ack.send(());
                        }

                        OwnershipEvent::Fatal { reason } => {
                            error!("fatal ownership failure: {reason}");
                            self.stop_all().await;
                            self.fatal_tx.send_replace(Some(reason));
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ManagerCommand::GetStatus { respond_to } => {
                            let _ = respond_to.send(self.status().await);
                        }

                        ManagerCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            self.stop_all().await;
                            let _ = respond_to.send(());
                            break;
                        }
                    }
                }

                else => {
                    warn!("all channels closed, shutting down");
                    break;
                }
            }
        }

        debug!("partition manager stopped");
    }

    async fn reconcile(&mut self, owned: BTreeSet<u32>) {
        let released: Vec<u32> = self
            .workers
            .keys()
            .filter(|p| !owned.contains(p))
            .copied()
            .collect();

        for partition in released {
            self.release(partition).await;
        }

        for partition in owned {
            if partition >= self.ctx.cache.partition_count() {
                warn!("ignoring out-of-range partition {partition}");
                continue;
            }
            if !self.workers.contains_key(&partition) {
                info!("starting partition {partition}");
                let handle = PartitionHandle::spawn(partition, self.ctx.clone());
                self.workers.insert(partition, handle);
            }
        }
    }

    async fn release(&mut self, partition: u32) {
        let Some(worker) = self.workers.remove(&partition) else {
            return;
        };
        info!("stopping partition {partition}");

        let keys = match worker.stop().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("partition {partition} worker already gone ({e:#}), dropping its keys");
                self.ctx.cache.drop_partition(partition)
            }
        };

        if let Err(e) = self.alarm.drop_partition(partition, keys).await {
            warn!("failed to tear down alarms of partition {partition}: {e:#}");
        }
    }

    async fn stop_all(&mut self) {
        let partitions: Vec<u32> = self.workers.keys().copied().collect();
        for partition in partitions {
            self.release(partition).await;
        }
    }

    async fn status(&self) -> Vec<PartitionStatus> {
        let mut statuses = Vec::with_capacity(self.workers.len());
        for worker in self.workers.values() {
            match worker.status().await {
                Ok(status) => statuses.push(status),
                Err(e) => warn!("partition {} did not report status: {e:#}", worker.partition),
            }
        }
        statuses
    }
}

/// Handle for controlling a PartitionManager
#[derive(Clone)]
pub struct PartitionManagerHandle {
    sender: mpsc::Sender<ManagerCommand>,
    fatal_rx: watch::Receiver<Option<String>>,
}

impl PartitionManagerHandle {
    /// Spawn the manager; ownership changes arrive on `event_rx`
    pub fn spawn(ctx: PartitionContext, alarm: AlarmHandle, event_rx: mpsc::Receiver<OwnershipEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let actor = PartitionManager::new(ctx, alarm, cmd_rx, event_rx, fatal_tx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            fatal_rx,
        }
    }

    /// Status of every running partition worker
    pub async fn status(&self) -> Result<Vec<PartitionStatus>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::GetStatus { respond_to: tx })
            .await
            .context("failed to send GetStatus command")?;

        rx.await.context("failed to receive response")
    }

    /// Resolves with the reason once coordination failed fatally
    pub async fn fatal(&self) -> String {
        let mut rx = self.fatal_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "partition manager stopped".to_string();
            }
        }
    }

    /// Stop every partition worker and the manager
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;

        rx.await.context("failed to receive response")
    }
}
