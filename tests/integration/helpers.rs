//! Helper functions for integration tests
//!
//! A `Cluster` holds the external services (UVE store, notification bus,
//! coordination service); each `Instance` is one alarm generator wired the
//! same way the binary wires it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};
use uve_alarmgen::{
    CollectorId, Contributor, UveContents, UveKey,
    actors::{
        alarm::AlarmHandle,
        collector::CollectorWatcherHandle,
        manager::PartitionManagerHandle,
        messages::{AlarmOutput, PartitionPhase},
        output::{OutputHandle, OutputSettings},
        ownership::{OwnershipConfig, OwnershipHandle},
        partition::{InstanceInfo, PartitionConfig, PartitionContext},
    },
    aggregate::AggregationConfig,
    bus::{Notification, NotificationSource, memory::MemoryBus},
    cache::UveCache,
    ownership::memory::MemoryCoordinator,
    retry::BackoffPolicy,
    rules::AlarmConfig,
    store::memory::MemoryUveStore,
};

const WAIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

pub fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

pub fn collector(addr: &str) -> CollectorId {
    CollectorId::new(addr, 0)
}

pub fn contents(value: Value) -> UveContents {
    serde_json::from_value(value).unwrap()
}

pub fn notification(
    key: &UveKey,
    struct_name: &str,
    collector: &CollectorId,
    generation: &str,
    value: Option<Value>,
) -> Notification {
    Notification {
        key: key.clone(),
        struct_name: struct_name.to_string(),
        generator: "g1".to_string(),
        collector: collector.clone(),
        generation: generation.to_string(),
        value,
    }
}

/// Poll `check` until it holds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(POLL).await;
    }
}

/// External services shared by every instance
pub struct Cluster {
    pub partitions: u32,
    pub store: Arc<MemoryUveStore>,
    pub bus: Arc<MemoryBus>,
    pub coordinator: Arc<MemoryCoordinator>,
}

impl Cluster {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            store: Arc::new(MemoryUveStore::new(partitions)),
            bus: Arc::new(MemoryBus::new(partitions)),
            coordinator: Arc::new(MemoryCoordinator::new(partitions, Duration::from_millis(300))),
        }
    }

    /// Write a contribution the way a collector does: store, then bus
    pub fn write(
        &self,
        key: &UveKey,
        struct_name: &str,
        collector: &CollectorId,
        generation: &str,
        value: Option<Value>,
    ) {
        match &value {
            Some(value) => self.store.put(
                key,
                struct_name,
                Contributor::new(collector.clone(), generation, "g1"),
                value.clone(),
            ),
            None => self.store.delete(key, struct_name),
        }
        self.bus
            .publish(&notification(key, struct_name, collector, generation, value));
    }
}

#[derive(Default)]
pub struct InstanceOptions {
    pub configs: Vec<AlarmConfig>,
    pub aggregations: Vec<AggregationConfig>,
    pub session_grace: Option<Duration>,
}

/// One running alarm generator
pub struct Instance {
    pub cache: Arc<UveCache>,
    pub watcher: CollectorWatcherHandle,
    pub alarm: AlarmHandle,
    pub output: OutputHandle,
    pub manager: PartitionManagerHandle,
    pub ownership: OwnershipHandle,
    pub stream: broadcast::Receiver<AlarmOutput>,
    bus: Arc<MemoryBus>,
}

impl Instance {
    pub async fn start(cluster: &Cluster, instance_id: &str, configs: Vec<AlarmConfig>) -> Self {
        Self::start_with(
            cluster,
            instance_id,
            InstanceOptions {
                configs,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn start_with(cluster: &Cluster, instance_id: &str, options: InstanceOptions) -> Self {
        let cache = Arc::new(UveCache::new(cluster.partitions));

        let watcher = CollectorWatcherHandle::spawn(cluster.store.clone(), Duration::from_millis(20), fast_retry());
        watcher.poll_now().await.unwrap();

        let (output, output_tx) = OutputHandle::spawn(OutputSettings::default()).unwrap();
        let stream = output.subscribe();

        // Timers are driven explicitly through `run_timers`
        let alarm = AlarmHandle::spawn(
            cache.clone(),
            options.configs,
            options.aggregations,
            output_tx,
            Duration::from_secs(3600),
        );

        let ctx = PartitionContext {
            cache: cache.clone(),
            store: cluster.store.clone(),
            bus: cluster.bus.clone(),
            reeval_tx: alarm.reeval_sender(),
            collectors_rx: watcher.subscribe(),
            instance: InstanceInfo {
                instance_id: instance_id.to_string(),
                addr: "127.0.0.1".to_string(),
                port: 0,
            },
            config: PartitionConfig {
                bootstrap_timeout: Duration::from_millis(300),
                pending_retry_interval: Duration::from_millis(20),
                fetch_batch: 64,
                retry: fast_retry(),
            },
        };

        let (event_tx, event_rx) = mpsc::channel(8);
        let manager = PartitionManagerHandle::spawn(ctx, alarm.clone(), event_rx);

        let ownership_config = OwnershipConfig {
            heartbeat_interval: Duration::from_millis(20),
            session_grace: options.session_grace.unwrap_or(Duration::from_secs(30)),
            retry: fast_retry(),
            ..OwnershipConfig::new(instance_id)
        };
        let ownership = OwnershipHandle::spawn(cluster.coordinator.clone(), ownership_config, event_tx);

        Self {
            cache,
            watcher,
            alarm,
            output,
            manager,
            ownership,
            stream,
            bus: cluster.bus.clone(),
        }
    }

    /// Wait until exactly `partitions` are owned and have a worker
    pub async fn wait_owned(&self, partitions: &[u32]) {
        let deadline = Instant::now() + WAIT;
        loop {
            let running: Vec<u32> = self
                .manager
                .status()
                .await
                .unwrap()
                .iter()
                .map(|status| status.partition)
                .collect();
            if running == partitions && self.cache.owned_partitions() == partitions {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "expected partitions {partitions:?}, running {running:?}"
            );
            sleep(POLL).await;
        }
    }

    /// Wait until every worker streams and consumed its log, then let the
    /// alarm and output actors catch up
    pub async fn settle(&self) {
        let deadline = Instant::now() + WAIT;
        loop {
            let statuses = self.manager.status().await.unwrap();
            let mut settled = true;
            for status in &statuses {
                let committed = self.bus.committed_offset(status.partition).await.unwrap();
                if status.phase != PartitionPhase::Streaming
                    || committed < self.bus.end_offset(status.partition)
                {
                    settled = false;
                }
            }
            if settled {
                break;
            }
            assert!(Instant::now() < deadline, "partitions did not settle: {statuses:?}");
            sleep(POLL).await;
        }

        self.alarm.drain().await.unwrap();
        self.output.flush().await.unwrap();
    }

    /// Next record on the output stream
    pub async fn next_output(&mut self) -> AlarmOutput {
        timeout(WAIT, self.stream.recv())
            .await
            .expect("no output record")
            .unwrap()
    }

    /// Next alarm (non-aggregate) record on the output stream
    pub async fn next_alarm_output(&mut self) -> AlarmOutput {
        loop {
            match self.next_output().await {
                AlarmOutput::Aggregate(_) => continue,
                other => return other,
            }
        }
    }

    pub async fn stop(self) {
        self.ownership.shutdown().await.unwrap();
        self.manager.shutdown().await.unwrap();
        self.alarm.shutdown().await.unwrap();
        self.output.shutdown().await.unwrap();
        self.watcher.shutdown().await.unwrap();
    }
}
