//! AlarmActor - Re-evaluation and timer task
//!
//! Owns every alarm state machine. Re-evaluation requests from partition
//! workers, the timer tick and config/ack commands are all handled on this
//! one task, so transitions of a `(key, alarm)` pair are totally ordered.
//!
//! ## Message Flow
//!
//! ```text
//! PartitionWorker ──ReevalRequest──▶ ┐
//! Timer tick (1s) ─────────────────▶ ├─▶ AlarmActor ──AlarmOutput──▶ OutputActor
//! Commands (config, ack, drop) ────▶ ┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, trace, warn};

use crate::UveKey;
use crate::aggregate::{AggregateRecord, AggregationConfig, Aggregator};
use crate::asm::{AckResult, AlarmTable, Clock, Micros, TimerOutcome, UveAlarms};
use crate::cache::UveCache;
use crate::rules::{AlarmConfig, RuleError, evaluate};

use super::messages::{AlarmCommand, AlarmOutput, AlarmStats, ReevalRequest};

/// Capacity of the re-evaluation queue
pub const REEVAL_QUEUE: usize = 1024;

pub struct AlarmActor {
    cache: Arc<UveCache>,
    configs: BTreeMap<String, AlarmConfig>,
    table: AlarmTable,
    aggregator: Aggregator,

    command_rx: mpsc::Receiver<AlarmCommand>,
    reeval_rx: mpsc::Receiver<ReevalRequest>,
    output_tx: mpsc::Sender<AlarmOutput>,

    clock: Clock,
    timer_interval: Duration,
    evaluations: u64,
}

impl AlarmActor {
    pub fn new(
        cache: Arc<UveCache>,
        configs: Vec<AlarmConfig>,
        aggregations: Vec<AggregationConfig>,
        command_rx: mpsc::Receiver<AlarmCommand>,
        reeval_rx: mpsc::Receiver<ReevalRequest>,
        output_tx: mpsc::Sender<AlarmOutput>,
        timer_interval: Duration,
    ) -> Self {
        let mut valid = BTreeMap::new();
        for config in configs {
            match config.validate() {
                Ok(()) => {
                    valid.insert(config.name.clone(), config);
                }
                Err(e) => warn!("ignoring {e}"),
            }
        }

        Self {
            cache,
            configs: valid,
            table: AlarmTable::new(),
            aggregator: Aggregator::new(aggregations),
            command_rx,
            reeval_rx,
            output_tx,
            clock: Clock::new(),
            timer_interval,
            evaluations: 0,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alarm actor with {} rules", self.configs.len());

        let mut ticker = interval(self.timer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(request) = self.reeval_rx.recv() => {
                    self.reevaluate(&request.key).await;
                }

                _ = ticker.tick() => {
                    let now = self.clock.now();
                    self.run_timers(now).await;
                }

                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        warn!("command channel closed, shutting down");
                        break;
                    };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
            }
        }

        debug!("alarm actor stopped");
    }

    /// Returns `false` on shutdown
    async fn handle_command(&mut self, cmd: AlarmCommand) -> bool {
        match cmd {
            AlarmCommand::SetConfig { config, respond_to } => {
                let result = self.set_config(config).await;
                let _ = respond_to.send(result);
            }

            AlarmCommand::DeleteConfig { name, respond_to } => {
                let existed = self.delete_config(&name).await;
                let _ = respond_to.send(existed);
            }

            AlarmCommand::GetConfigs { respond_to } => {
                let _ = respond_to.send(self.configs.values().cloned().collect());
            }

            AlarmCommand::Ack {
                key,
                alarm_name,
                timestamp,
                respond_to,
            } => {
                let (result, changed) = self.table.ack(&key, &alarm_name, timestamp, self.clock.now());
                debug!("ack {alarm_name} on {key} at {timestamp}: {result:?}");
                if changed {
                    self.publish(&key).await;
                }
                let _ = respond_to.send(result);
            }

            AlarmCommand::DropPartition {
                partition,
                keys,
                respond_to,
            } => {
                self.drop_partition(partition, keys).await;
                let _ = respond_to.send(());
            }

            AlarmCommand::GetAlarms { respond_to } => {
                let _ = respond_to.send(self.table.all_alarms());
            }

            AlarmCommand::GetAggregates { respond_to } => {
                let _ = respond_to.send(self.aggregator.records());
            }

            AlarmCommand::RunTimers { now, respond_to } => {
                let now = now.unwrap_or_else(|| self.clock.now());
                let outcome = self.run_timers(now).await;
                let _ = respond_to.send(outcome);
            }

            AlarmCommand::Drain { respond_to } => {
                while let Ok(request) = self.reeval_rx.try_recv() {
                    self.reevaluate(&request.key).await;
                }
                let _ = respond_to.send(());
            }

            AlarmCommand::GetStats { respond_to } => {
                let _ = respond_to.send(AlarmStats {
                    configs: self.configs.len(),
                    machines: self.table.len(),
                    alarmed_uves: self.table.all_alarms().len(),
                    evaluations: self.evaluations,
                });
            }

            AlarmCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }
        true
    }

    /// Evaluate every applicable rule against the cached contents of `key`
    async fn reevaluate(&mut self, key: &UveKey) {
        let partition = key.partition(self.cache.partition_count());
        if self.cache.partition_info(partition).is_none() {
            // The partition left while the request was queued
            if self.table.remove_key(key) {
                self.emit(AlarmOutput::Clear { key: key.clone() }).await;
            }
            let records = self.aggregator.remove(key);
            self.emit_aggregates(records).await;
            return;
        }

        let contents = self.cache.lookup(key).unwrap_or_default();
        let now = self.clock.now();
        let mut changed = false;

        for cfg in self.configs.values().filter(|cfg| cfg.applies_to(key)) {
            let result = evaluate(cfg, key, &contents);
            self.evaluations += 1;
            changed |= self.table.process(key, cfg, result, now);
        }

        trace!("re-evaluated {key}, changed={changed}");
        if changed {
            self.publish(key).await;
        }
        let records = self.aggregator.update(key, &contents);
        self.emit_aggregates(records).await;
    }

    async fn set_config(&mut self, config: AlarmConfig) -> Result<(), RuleError> {
        config.validate()?;
        info!("alarm rule {} updated", config.name);

        // Machines on keys the rule no longer covers go away
        let mut changed = BTreeSet::new();
        for key in self.table.keys() {
            if self.table.machine(&key, &config.name).is_some()
                && !config.applies_to(&key)
                && self.table.remove(&key, &config.name)
            {
                changed.insert(key);
            }
        }

        let now = self.clock.now();
        for key in self.cache.all_keys() {
            if !config.applies_to(&key) {
                continue;
            }
            let contents = self.cache.lookup(&key).unwrap_or_default();
            let result = evaluate(&config, &key, &contents);
            self.evaluations += 1;
            if self.table.process(&key, &config, result, now) {
                changed.insert(key);
            }
        }

        self.configs.insert(config.name.clone(), config);
        for key in changed {
            self.publish(&key).await;
        }
        Ok(())
    }

    async fn delete_config(&mut self, name: &str) -> bool {
        if self.configs.remove(name).is_none() {
            return false;
        }
        info!("alarm rule {name} deleted");
        for key in self.table.remove_alarm(name) {
            self.publish(&key).await;
        }
        true
    }

    async fn drop_partition(&mut self, partition: u32, keys: Vec<UveKey>) {
        let partitions = self.cache.partition_count();
        let mut doomed: BTreeSet<UveKey> = keys.into_iter().collect();
        doomed.extend(
            self.table
                .keys()
                .into_iter()
                .filter(|key| key.partition(partitions) == partition),
        );

        let mut records = BTreeMap::new();
        for key in doomed {
            if self.table.remove_key(&key) {
                self.emit(AlarmOutput::Clear { key: key.clone() }).await;
            }
            for record in self.aggregator.remove(&key) {
                let id = (record.table.clone(), record.struct_name.clone(), record.field.clone(), record.op);
                records.insert(id, record);
            }
        }
        debug!("partition {partition}: alarms torn down");

        self.emit_aggregates(records.into_values().collect()).await;
    }

    async fn run_timers(&mut self, now: Micros) -> TimerOutcome {
        let outcome = self.table.run_timers(now);
        for (key, alarm_name) in &outcome.deleted {
            trace!("alarm {alarm_name} on {key} deleted");
        }
        for key in &outcome.changed {
            self.publish(key).await;
        }
        outcome
    }

    /// Emit the current public alarms of `key`
    async fn publish(&self, key: &UveKey) {
        let output = match self.table.uve_alarms(key) {
            Some(alarms) => AlarmOutput::Update(alarms),
            None => AlarmOutput::Clear { key: key.clone() },
        };
        self.emit(output).await;
    }

    async fn emit_aggregates(&self, records: Vec<AggregateRecord>) {
        for record in records {
            self.emit(AlarmOutput::Aggregate(record)).await;
        }
    }

    async fn emit(&self, output: AlarmOutput) {
        if self.output_tx.send(output).await.is_err() {
            trace!("output channel closed");
        }
    }
}

/// Handle for controlling an AlarmActor
#[derive(Clone)]
pub struct AlarmHandle {
    sender: mpsc::Sender<AlarmCommand>,
    reeval_tx: mpsc::Sender<ReevalRequest>,
}

impl AlarmHandle {
    /// Spawn the actor with its initial rules and aggregates
    pub fn spawn(
        cache: Arc<UveCache>,
        configs: Vec<AlarmConfig>,
        aggregations: Vec<AggregationConfig>,
        output_tx: mpsc::Sender<AlarmOutput>,
        timer_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (reeval_tx, reeval_rx) = mpsc::channel(REEVAL_QUEUE);

        let actor = AlarmActor::new(
            cache,
            configs,
            aggregations,
            cmd_rx,
            reeval_rx,
            output_tx,
            timer_interval,
        );
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            reeval_tx,
        }
    }

    /// Sender partition workers enqueue changed keys on
    pub fn reeval_sender(&self) -> mpsc::Sender<ReevalRequest> {
        self.reeval_tx.clone()
    }

    pub async fn set_config(&self, config: AlarmConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::SetConfig { config, respond_to: tx })
            .await
            .context("failed to send SetConfig command")?;

        rx.await.context("failed to receive response")??;
        Ok(())
    }

    /// Returns whether the rule existed
    pub async fn delete_config(&self, name: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::DeleteConfig {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .context("failed to send DeleteConfig command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn configs(&self) -> Result<Vec<AlarmConfig>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::GetConfigs { respond_to: tx })
            .await
            .context("failed to send GetConfigs command")?;

        rx.await.context("failed to receive response")
    }

    /// The ack RPC
    pub async fn ack(&self, key: UveKey, alarm_name: &str, timestamp: Micros) -> Result<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::Ack {
                key,
                alarm_name: alarm_name.to_string(),
                timestamp,
                respond_to: tx,
            })
            .await
            .context("failed to send Ack command")?;

        rx.await.context("failed to receive response")
    }

    /// Tear down the alarms of a released partition
    pub async fn drop_partition(&self, partition: u32, keys: Vec<UveKey>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::DropPartition {
                partition,
                keys,
                respond_to: tx,
            })
            .await
            .context("failed to send DropPartition command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn alarms(&self) -> Result<Vec<UveAlarms>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::GetAlarms { respond_to: tx })
            .await
            .context("failed to send GetAlarms command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn aggregates(&self) -> Result<Vec<AggregateRecord>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::GetAggregates { respond_to: tx })
            .await
            .context("failed to send GetAggregates command")?;

        rx.await.context("failed to receive response")
    }

    /// Run a timer pass at `now` (or the current time)
    pub async fn run_timers(&self, now: Option<Micros>) -> Result<TimerOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::RunTimers { now, respond_to: tx })
            .await
            .context("failed to send RunTimers command")?;

        rx.await.context("failed to receive response")
    }

    /// Wait until every queued re-evaluation has been processed
    pub async fn drain(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::Drain { respond_to: tx })
            .await
            .context("failed to send Drain command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn stats(&self) -> Result<AlarmStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::GetStats { respond_to: tx })
            .await
            .context("failed to send GetStats command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AlarmCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
