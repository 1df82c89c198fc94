//! PartitionWorker - Owns one partition of the UVE cache
//!
//! ## Lifecycle
//!
//! ```text
//! spawn ──▶ Bootstrapping ──(every reachable collector folded in, or timeout)──▶ Streaming ──Stop──▶ dropped
//! ```
//!
//! **Bootstrap**: for each live collector, the worker reads the partition
//! manifest from the UVE store and installs the listed structs, tagged with
//! `(collector, generation, generator)`. Collectors that cannot be read are
//! retried until the bootstrap timeout and then keep being retried while
//! streaming; structs they publish meanwhile are cached as provisional.
//!
//! **Streaming**: notifications are applied in offset order. The offset is
//! committed after the batch was applied and every re-evaluation enqueued.
//!
//! **Collector hand-off**: a collector that leaves the live set loses all its
//! entries; one that appears (or restarts) is folded in from the store.
//!
//! The worker is the only writer of its partition slice.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout_at};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bus::{Notification, NotificationSource, RawRecord};
use crate::cache::{ApplyOutcome, PartitionInfo, UveCache};
use crate::retry::{BackoffPolicy, Retryable, retry_with_backoff};
use crate::store::{StoreError, UveStore};
use crate::{CollectorId, CollectorSet, Contributor, UveKey};

use super::messages::{PartitionCommand, PartitionPhase, PartitionStatus, ReevalRequest};

/// Tunables of partition workers
#[derive(Debug, Clone, Copy)]
pub struct PartitionConfig {
    /// Time bootstrap waits for unreachable collectors before streaming
    pub bootstrap_timeout: Duration,

    /// Interval at which unreachable collectors are retried
    pub pending_retry_interval: Duration,

    /// Maximum records fetched per batch
    pub fetch_batch: usize,

    pub retry: BackoffPolicy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(30),
            pending_retry_interval: Duration::from_secs(5),
            fetch_batch: 256,
            retry: BackoffPolicy::default(),
        }
    }
}

/// Identity of this alarm generator instance, recorded per owned partition
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub addr: String,
    pub port: u16,
}

/// Everything a partition worker needs, shared by all workers
#[derive(Clone)]
pub struct PartitionContext {
    pub cache: Arc<UveCache>,
    pub store: Arc<dyn UveStore>,
    pub bus: Arc<dyn NotificationSource>,

    /// Bounded; a full queue blocks the worker
    pub reeval_tx: mpsc::Sender<ReevalRequest>,

    pub collectors_rx: watch::Receiver<CollectorSet>,
    pub instance: InstanceInfo,
    pub config: PartitionConfig,
}

/// Actor that bootstraps and streams one partition
pub struct PartitionWorker {
    partition: u32,
    cache: Arc<UveCache>,
    store: Arc<dyn UveStore>,
    bus: Arc<dyn NotificationSource>,
    reeval_tx: mpsc::Sender<ReevalRequest>,
    collectors_rx: watch::Receiver<CollectorSet>,
    instance: InstanceInfo,
    config: PartitionConfig,

    command_rx: mpsc::Receiver<PartitionCommand>,

    phase: PartitionPhase,

    /// Next offset to consume
    offset: u64,

    /// Live collectors and the generation applied for each
    collectors: CollectorSet,

    /// Generations replaced by a newer one; their records are stale
    retired: BTreeMap<CollectorId, BTreeSet<String>>,

    /// Live collectors whose contributions could not be read yet
    pending: BTreeSet<CollectorId>,

    /// Set once a Stop command arrives
    stop: Option<oneshot::Sender<Vec<UveKey>>>,
}

impl PartitionWorker {
    pub fn new(partition: u32, ctx: PartitionContext, command_rx: mpsc::Receiver<PartitionCommand>) -> Self {
        Self {
            partition,
            cache: ctx.cache,
            store: ctx.store,
            bus: ctx.bus,
            reeval_tx: ctx.reeval_tx,
            collectors_rx: ctx.collectors_rx,
            instance: ctx.instance,
            config: ctx.config,
            command_rx,
            phase: PartitionPhase::Bootstrapping,
            offset: 0,
            collectors: CollectorSet::new(),
            retired: BTreeMap::new(),
            pending: BTreeSet::new(),
            stop: None,
        }
    }

    #[instrument(skip(self), fields(partition = self.partition))]
    pub async fn run(mut self) {
        info!("acquiring partition");

        self.cache.add_partition(
            self.partition,
            PartitionInfo {
                instance_id: self.instance.instance_id.clone(),
                addr: self.instance.addr.clone(),
                port: self.instance.port,
                acquire_time: Utc::now(),
            },
        );

        if self.bootstrap().await {
            self.stream().await;
        }

        match self.stop.take() {
            Some(respond_to) => {
                let keys = self.cache.drop_partition(self.partition);
                info!("released partition, {} keys dropped", keys.len());
                let _ = respond_to.send(keys);
            }
            None => warn!("partition worker exited without a stop request"),
        }
    }

    /// Fold in every live collector
    ///
    /// Returns `false` when a stop request arrived meanwhile.
    async fn bootstrap(&mut self) -> bool {
        let deadline = Instant::now() + self.config.bootstrap_timeout;

        let committed = retry_with_backoff("read committed offset", self.config.retry, || {
            self.bus.committed_offset(self.partition)
        })
        .await;
        self.offset = match committed {
            Ok(offset) => offset,
            Err(e) => {
                warn!("failed to read committed offset, starting from 0: {e}");
                0
            }
        };

        let live = self.collectors_rx.borrow_and_update().clone();
        debug!("bootstrapping from {} live collectors at offset {}", live.len(), self.offset);

        for (collector, generation) in live {
            if !self.poll_commands() {
                return false;
            }
            self.collectors.insert(collector.clone(), generation.clone());

            match timeout_at(deadline, self.fold_in(&collector, &generation)).await {
                Ok(Ok(installed)) => debug!("folded in {installed} structs of {collector}"),
                Ok(Err(e)) => {
                    warn!("collector {collector} unreachable during bootstrap: {e}");
                    self.pending.insert(collector);
                }
                Err(_) => {
                    warn!("bootstrap timeout reached while reading collector {collector}");
                    self.pending.insert(collector);
                }
            }
        }

        while !self.pending.is_empty() && Instant::now() < deadline {
            if !self.poll_commands() {
                return false;
            }
            tokio::select! {
                _ = sleep(self.config.pending_retry_interval) => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
            self.retry_pending().await;
        }

        if !self.pending.is_empty() {
            warn!(
                "entering streaming with {} unreachable collectors, their keys stay provisional",
                self.pending.len()
            );
        }

        self.phase = PartitionPhase::Streaming;
        info!("bootstrap complete, streaming from offset {}", self.offset);
        self.poll_commands()
    }

    /// Answer queued commands without blocking
    ///
    /// Returns `false` once a stop request was received.
    fn poll_commands(&mut self) -> bool {
        while let Ok(cmd) = self.command_rx.try_recv() {
            if !self.handle_command(cmd) {
                return false;
            }
        }
        self.stop.is_none()
    }

    fn handle_command(&mut self, cmd: PartitionCommand) -> bool {
        match cmd {
            PartitionCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
                true
            }
            PartitionCommand::Stop { respond_to } => {
                debug!("received Stop command");
                self.stop = Some(respond_to);
                false
            }
        }
    }

    async fn stream(&mut self) {
        let mut pending_ticker = interval(self.config.pending_retry_interval);
        pending_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watcher_open = true;

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                changed = self.collectors_rx.changed(), if watcher_open => {
                    match changed {
                        Ok(()) => self.on_collectors_changed().await,
                        Err(_) => {
                            debug!("collector watcher gone, keeping last live set");
                            watcher_open = false;
                        }
                    }
                }

                fetched = self.bus.fetch(self.partition, self.offset, self.config.fetch_batch) => {
                    match fetched {
                        Ok(records) => self.apply_batch(records).await,
                        Err(e) if e.is_retryable() => {
                            warn!("failed to fetch notifications: {e}");
                            sleep(self.config.retry.delay(0)).await;
                        }
                        Err(e) => {
                            error!("notification stream failed: {e}");
                            break;
                        }
                    }
                }

                _ = pending_ticker.tick(), if !self.pending.is_empty() => {
                    self.retry_pending().await;
                }
            }
        }
    }

    async fn apply_batch(&mut self, records: Vec<RawRecord>) {
        let Some(next) = records.last().map(|r| r.offset + 1) else {
            return;
        };
        trace!("applying {} records", records.len());

        for record in records {
            self.handle_record(record).await;
        }
        self.offset = next;

        let committed = retry_with_backoff("commit offset", self.config.retry, || {
            self.bus.commit(self.partition, next)
        })
        .await;
        if let Err(e) = committed {
            warn!("failed to commit offset {next}: {e}");
        }
    }

    /// Apply one notification to the cache
    async fn handle_record(&mut self, record: RawRecord) {
        let notification = match Notification::decode(&record) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("skipping record at offset {}: {e}", record.offset);
                return;
            }
        };
        let Notification {
            key,
            struct_name,
            collector,
            generation,
            ..
        } = &notification;

        if key.partition(self.cache.partition_count()) != self.partition {
            warn!("skipping {key}: belongs to another partition");
            return;
        }

        let Some(stored) = self.collectors.get(collector).cloned() else {
            trace!("discarding {key} {struct_name}: collector {collector} not live");
            return;
        };

        if stored != *generation {
            if self.is_retired(collector, generation) {
                trace!("discarding {key} {struct_name}: stale generation {generation}");
                return;
            }
            info!("collector {collector} restarted ({stored} -> {generation})");
            self.switch_generation(collector, &stored, generation).await;
        }

        let contributor = notification.contributor();
        let outcome = match notification.value.clone() {
            Some(value) => {
                let provisional = self.pending.contains(collector);
                self.cache.insert(key, struct_name, value, contributor, provisional)
            }
            None => match self.cache.remove(key, struct_name, Some(&contributor)) {
                ApplyOutcome::ContributorMismatch => self.resolve_deletion(key, struct_name).await,
                outcome => outcome,
            },
        };

        trace!("{key} {struct_name}: {outcome:?}");
        if outcome.changed() {
            self.enqueue(key.clone()).await;
        }
    }

    /// A deletion by a contributor that no longer owns the cached struct
    ///
    /// The store decides: the struct stays only if it still exists there.
    async fn resolve_deletion(&self, key: &UveKey, struct_name: &str) -> ApplyOutcome {
        let read = retry_with_backoff("re-read UVE", self.config.retry, || {
            self.store.get_uve(key, Some(struct_name))
        })
        .await;

        match read {
            Ok(contents) if contents.contains_key(struct_name) => ApplyOutcome::Unchanged,
            Ok(_) => self.cache.remove(key, struct_name, None),
            Err(e) if e.is_not_found() => self.cache.remove(key, struct_name, None),
            Err(e) => {
                warn!("could not resolve deletion of {key} {struct_name}: {e}");
                ApplyOutcome::Unchanged
            }
        }
    }

    fn is_retired(&self, collector: &CollectorId, generation: &str) -> bool {
        self.retired
            .get(collector)
            .is_some_and(|generations| generations.contains(generation))
    }

    /// Purge the old generation of a collector and fold in the new one
    async fn switch_generation(&mut self, collector: &CollectorId, old: &str, new: &str) {
        let purged = self.cache.purge_collector(self.partition, collector, Some(new));
        for key in purged {
            self.enqueue(key).await;
        }

        self.retired
            .entry(collector.clone())
            .or_default()
            .insert(old.to_string());
        self.collectors.insert(collector.clone(), new.to_string());
        self.fold_in_or_defer(collector, new).await;
    }

    async fn on_collectors_changed(&mut self) {
        let live = self.collectors_rx.borrow_and_update().clone();

        let removed: Vec<CollectorId> = self
            .collectors
            .keys()
            .filter(|c| !live.contains_key(*c))
            .cloned()
            .collect();

        for collector in removed {
            info!("collector {collector} left, purging its contributions");
            self.collectors.remove(&collector);
            self.pending.remove(&collector);
            self.retired.remove(&collector);
            for key in self.cache.purge_collector(self.partition, &collector, None) {
                self.enqueue(key).await;
            }
        }

        for (collector, generation) in live {
            match self.collectors.get(&collector).cloned() {
                Some(stored) if stored == generation => continue,
                Some(_) if self.is_retired(&collector, &generation) => continue,
                Some(stored) => {
                    info!("collector {collector} restarted ({stored} -> {generation})");
                    self.switch_generation(&collector, &stored, &generation).await;
                }
                None => {
                    info!("collector {collector} appeared, folding in its contributions");
                    self.collectors.insert(collector.clone(), generation.clone());
                    self.fold_in_or_defer(&collector, &generation).await;
                }
            }
        }
    }

    async fn fold_in_or_defer(&mut self, collector: &CollectorId, generation: &str) {
        match self.fold_in(collector, generation).await {
            Ok(installed) => {
                debug!("folded in {installed} structs of {collector}");
                self.confirm(collector);
            }
            Err(e) => {
                warn!("deferring collector {collector}: {e}");
                self.pending.insert(collector.clone());
            }
        }
    }

    async fn retry_pending(&mut self) {
        let pending: Vec<CollectorId> = self.pending.iter().cloned().collect();
        for collector in pending {
            let Some(generation) = self.collectors.get(&collector).cloned() else {
                self.pending.remove(&collector);
                continue;
            };
            match self.fold_in(&collector, &generation).await {
                Ok(installed) => {
                    info!("collector {collector} reachable again, folded in {installed} structs");
                    self.confirm(&collector);
                }
                Err(e) => debug!("collector {collector} still unreachable: {e}"),
            }
        }
    }

    fn confirm(&mut self, collector: &CollectorId) {
        if self.pending.remove(collector) {
            let confirmed = self.cache.confirm_collector(self.partition, collector);
            debug!("confirmed {confirmed} provisional structs of {collector}");
        }
    }

    /// Install the contributions of one collector generation from the store
    ///
    /// Returns the number of structs installed.
    async fn fold_in(&self, collector: &CollectorId, generation: &str) -> Result<usize, StoreError> {
        let manifest = retry_with_backoff("list partition contents", self.config.retry, || {
            self.store.list_partition_contents(self.partition, collector)
        })
        .await;
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };

        let partitions = self.cache.partition_count();
        let mut installed = 0;

        for (generator, keys) in manifest {
            for (key, structs) in keys {
                if key.partition(partitions) != self.partition {
                    warn!("store listed {key} under the wrong partition");
                    continue;
                }

                let contents = match retry_with_backoff("read UVE", self.config.retry, || {
                    self.store.get_uve(&key, None)
                })
                .await
                {
                    Ok(contents) => contents,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };

                let contributor = Contributor::new(collector.clone(), generation, generator.clone());
                let mut changed = false;
                for struct_name in structs {
                    let Some(value) = contents.get(&struct_name) else {
                        continue;
                    };
                    let outcome = self
                        .cache
                        .insert(&key, &struct_name, value.clone(), contributor.clone(), false);
                    changed |= outcome.changed();
                    installed += 1;
                }

                if changed {
                    self.enqueue(key).await;
                }
            }
        }

        Ok(installed)
    }

    async fn enqueue(&self, key: UveKey) {
        let request = ReevalRequest {
            key,
            partition: self.partition,
        };
        if self.reeval_tx.send(request).await.is_err() {
            trace!("re-evaluation channel closed");
        }
    }

    fn status(&self) -> PartitionStatus {
        PartitionStatus {
            partition: self.partition,
            phase: self.phase,
            offset: self.offset,
            collectors: self.collectors.clone(),
            pending: self.pending.iter().cloned().collect(),
            info: self.cache.partition_info(self.partition),
            keys: self.cache.partition_keys(self.partition).len(),
        }
    }
}

/// Handle for controlling a PartitionWorker
#[derive(Clone)]
pub struct PartitionHandle {
    sender: mpsc::Sender<PartitionCommand>,
    pub partition: u32,
}

impl PartitionHandle {
    /// Spawn a worker that acquires `partition`
    pub fn spawn(partition: u32, ctx: PartitionContext) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let worker = PartitionWorker::new(partition, ctx, cmd_rx);
        tokio::spawn(worker.run());

        Self {
            sender: cmd_tx,
            partition,
        }
    }

    pub async fn status(&self) -> Result<PartitionStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PartitionCommand::GetStatus { respond_to: tx })
            .await
            .context("failed to send GetStatus command")?;

        rx.await.context("failed to receive response")
    }

    /// Relinquish the partition; returns the keys dropped from the cache
    pub async fn stop(&self) -> Result<Vec<UveKey>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PartitionCommand::Stop { respond_to: tx })
            .await
            .context("failed to send Stop command")?;

        rx.await.context("failed to receive response")
    }
}
