use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt};
use uve_alarmgen::{
    actors::{
        alarm::AlarmHandle,
        collector::CollectorWatcherHandle,
        manager::PartitionManagerHandle,
        output::{OutputHandle, OutputSettings},
        ownership::{OwnershipConfig, OwnershipHandle},
        partition::{InstanceInfo, PartitionConfig, PartitionContext},
    },
    bus::memory::MemoryBus,
    cache::UveCache,
    config::{Args, Config, read_config_file},
    ownership::memory::MemoryCoordinator,
    retry::BackoffPolicy,
    store::{UveStore, http::HttpUveStore, memory::MemoryUveStore},
};

const COLLECTOR_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SESSION_TIMEOUT: Duration = Duration::from_secs(10);
const TIMER_INTERVAL: Duration = Duration::from_secs(1);
const OUTPUT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

fn init(args: &Args) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(&args.log_level)
        .with_context(|| format!("invalid log level '{}'", args.log_level))?;

    let filter = filter::Targets::new().with_targets(vec![("uve_alarmgen", level), ("alarmgen", level)]);

    let writer = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(&args)?;
    trace!("started with args: {args:?}");

    let config = match &args.conf_file {
        Some(path) => read_config_file(path).with_context(|| format!("failed to load {path}"))?,
        None => Config::default(),
    };
    info!(
        "loaded {} alarm rules and {} aggregates",
        config.alarms.len(),
        config.aggregations.len()
    );

    let instance_id = args
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("{}:{}", args.host_ip, args.http_server_port));

    let store: Arc<dyn UveStore> = {
        let endpoints = args.uve_store_endpoints();
        if endpoints.is_empty() {
            info!("no UVE store configured, using in-process store");
            Arc::new(MemoryUveStore::new(args.partitions))
        } else {
            Arc::new(HttpUveStore::new(endpoints, Duration::from_secs(5))?)
        }
    };

    if !args.kafka_broker_list.is_empty() {
        warn!(
            "notification bus {:?} not supported, consuming the in-process bus",
            args.kafka_broker_list
        );
    }
    let bus = Arc::new(MemoryBus::new(args.partitions));

    if !args.zk_list.is_empty() {
        warn!(
            "coordination service {:?} not supported, running standalone",
            args.zk_list
        );
    }
    let coordinator = Arc::new(MemoryCoordinator::new(args.partitions, SESSION_TIMEOUT));

    let cache = Arc::new(UveCache::new(args.partitions));

    // Partition workers bootstrap from the live set known when they start
    let watcher = CollectorWatcherHandle::spawn(store.clone(), COLLECTOR_POLL_INTERVAL, BackoffPolicy::default());
    match watcher.poll_now().await {
        Ok(collectors) => info!("{} live collectors", collectors.len()),
        Err(e) => warn!("initial collector poll failed: {e:#}"),
    }

    let (output, output_tx) = OutputHandle::spawn(OutputSettings {
        rate_limit: args.sandesh_send_rate_limit,
        webhook: config.webhook.clone(),
        shutdown_deadline: OUTPUT_SHUTDOWN_DEADLINE,
    })?;

    let alarm = AlarmHandle::spawn(
        cache.clone(),
        config.alarms,
        config.aggregations,
        output_tx,
        TIMER_INTERVAL,
    );

    let ctx = PartitionContext {
        cache: cache.clone(),
        store,
        bus,
        reeval_tx: alarm.reeval_sender(),
        collectors_rx: watcher.subscribe(),
        instance: InstanceInfo {
            instance_id: instance_id.clone(),
            addr: args.host_ip.clone(),
            port: args.http_server_port,
        },
        config: PartitionConfig {
            bootstrap_timeout: Duration::from_secs(args.bootstrap_timeout),
            ..PartitionConfig::default()
        },
    };

    let (event_tx, event_rx) = mpsc::channel(8);
    let manager = PartitionManagerHandle::spawn(ctx, alarm.clone(), event_rx);
    let ownership = OwnershipHandle::spawn(coordinator, OwnershipConfig::new(instance_id), event_tx);

    #[cfg(feature = "api")]
    {
        use uve_alarmgen::api::{ApiConfig, ApiState, spawn_api_server};

        let state = ApiState::new(
            cache.clone(),
            alarm.clone(),
            output.clone(),
            manager.clone(),
            ownership.clone(),
        );
        spawn_api_server(ApiConfig::on_port(args.http_server_port), state).await?;
    }

    let fatal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for ctrl-c: {e}");
            }
            info!("shutting down");
            None
        }
        reason = manager.fatal() => {
            error!("fatal: {reason}");
            Some(reason)
        }
    };

    if let Err(e) = ownership.shutdown().await {
        warn!("{e:#}");
    }
    if let Err(e) = manager.shutdown().await {
        warn!("{e:#}");
    }
    if let Err(e) = alarm.drain().await {
        warn!("{e:#}");
    }
    if let Err(e) = alarm.shutdown().await {
        warn!("{e:#}");
    }
    if let Err(e) = output.shutdown().await {
        warn!("{e:#}");
    }
    if let Err(e) = watcher.shutdown().await {
        warn!("{e:#}");
    }

    match fatal {
        Some(reason) => Err(anyhow::anyhow!("stopped after fatal error: {reason}")),
        None => Ok(()),
    }
}
