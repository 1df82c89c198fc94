use std::path::PathBuf;

use clap::Parser;
use tracing::trace;

use crate::aggregate::AggregationConfig;
use crate::rules::AlarmConfig;

/// Command line options of the alarm generator
#[derive(Debug, Clone, Parser)]
#[command(name = "alarmgen", about = "Partitioned UVE aggregation and alarm evaluation")]
pub struct Args {
    /// Port of the introspection endpoint
    #[arg(long = "http_server_port", default_value_t = 5995)]
    pub http_server_port: u16,

    /// Coordination service endpoints; empty runs standalone
    #[arg(long = "zk_list", value_delimiter = ',', num_args = 0..)]
    pub zk_list: Vec<String>,

    /// UVE store endpoints (`host` or `host:port`); empty uses an in-process store
    #[arg(long = "redis_uve_list", value_delimiter = ',', num_args = 0..)]
    pub redis_uve_list: Vec<String>,

    /// Port used for UVE store entries without one
    #[arg(long = "redis_server_port", default_value_t = 6379)]
    pub redis_server_port: u16,

    /// Notification bus endpoints
    #[arg(long = "kafka_broker_list", value_delimiter = ',', num_args = 0..)]
    pub kafka_broker_list: Vec<String>,

    /// Number of partitions of the UVE keyspace
    #[arg(long, default_value_t = 15)]
    pub partitions: u32,

    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long = "log_file")]
    pub log_file: Option<PathBuf>,

    /// Emitted records per second; 0 disables the cap
    #[arg(long = "sandesh_send_rate_limit", default_value_t = 0)]
    pub sandesh_send_rate_limit: u32,

    /// JSON file with alarm rules, aggregates and the webhook sink
    #[arg(long = "conf_file")]
    pub conf_file: Option<String>,

    /// Seconds to wait for an unreachable collector during bootstrap
    #[arg(long = "bootstrap_timeout", default_value_t = 30)]
    pub bootstrap_timeout: u64,

    /// Name this instance registers under
    #[arg(long = "instance_id")]
    pub instance_id: Option<String>,

    /// Address this instance is reachable at, recorded per owned partition
    #[arg(long = "host_ip", default_value = "127.0.0.1")]
    pub host_ip: String,
}

impl Args {
    /// Base URLs of the configured UVE stores
    pub fn uve_store_endpoints(&self) -> Vec<String> {
        self.redis_uve_list
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.rsplit_once(':') {
                Some((_, port)) if port.parse::<u16>().is_ok() => format!("http://{entry}"),
                _ => format!("http://{entry}:{}", self.redis_server_port),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,

    #[serde(default)]
    pub aggregations: Vec<AggregationConfig>,

    /// Optional HTTP sink for alarm output
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    /// Attempts per record before it is dropped
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: usize,

    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_send_failures() -> usize {
    5
}

fn default_webhook_timeout_ms() -> u64 {
    2000
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file: {e}"))?;
    for alarm in &config.alarms {
        alarm.validate()?;
    }
    trace!("loaded config: {config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_config_defaults() {
        let config = parse_config(
            r#"{
                "alarms": [{
                    "name": "process-down",
                    "uve_tables": ["ObjectVRouter"],
                    "or_list": [[{"operand1": "NodeStatus.state", "operation": "!=", "operand2": {"json_value": "\"up\""}}]]
                }],
                "webhook": {"url": "http://localhost:9000/alarms"}
            }"#,
        )
        .unwrap();

        let alarm = &config.alarms[0];
        assert_eq!(alarm.active_timer_s, 0);
        assert_eq!(alarm.idle_timer_s, 0);
        assert!(!alarm.freq_exceeded_check);
        assert!(config.aggregations.is_empty());

        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.max_send_failures, 5);
        assert_eq!(webhook.timeout_ms, 2000);
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let result = parse_config(r#"{"alarms": [{"name": "empty", "uve_tables": [], "or_list": []}]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"aggregations": [{{"table": "ObjectVRouter", "struct_name": "VrouterStats", "field": "flows", "op": "sum"}}]}}"#
        )
        .unwrap();

        let config = read_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.aggregations.len(), 1);
        assert!(config.alarms.is_empty());
    }

    #[test]
    fn test_uve_store_endpoints() {
        let args = Args::parse_from([
            "alarmgen",
            "--redis_uve_list",
            "10.0.0.1,10.0.0.2:7000",
            "--redis_server_port",
            "6381",
        ]);

        assert_eq!(
            args.uve_store_endpoints(),
            vec!["http://10.0.0.1:6381".to_string(), "http://10.0.0.2:7000".to_string()]
        );
        assert_eq!(args.partitions, 15);
        assert_eq!(args.bootstrap_timeout, 30);
    }
}
