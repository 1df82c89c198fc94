//! Integration tests for the introspection endpoint
//!
//! These tests verify that:
//! - Read endpoints expose partitions, UVEs, alarms and counters
//! - The ack RPC maps its result onto status codes
//! - Alarm rules can be created and deleted over HTTP
//! - The WebSocket stream forwards alarm output records

use std::net::SocketAddr;

use axum::http::StatusCode;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uve_alarmgen::{
    UveKey,
    api::{ApiConfig, ApiState, spawn_api_server},
    rules::{AlarmConfig, AlarmExpression, Operand2, Operation},
};

use crate::helpers::{Cluster, Instance, collector};

fn vrouter(host: &str) -> UveKey {
    UveKey::new("ObjectVRouter", host)
}

fn down_rule() -> AlarmConfig {
    AlarmConfig::new(
        "vrouter-down",
        &["ObjectVRouter"],
        vec![vec![AlarmExpression::new(
            "NodeStatus.state",
            Operation::Eq,
            Operand2::Json(json!("down")),
        )]],
    )
}

async fn spawn_test_api(instance: &Instance) -> SocketAddr {
    let state = ApiState::new(
        instance.cache.clone(),
        instance.alarm.clone(),
        instance.output.clone(),
        instance.manager.clone(),
        instance.ownership.clone(),
    );

    let config = ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        enable_cors: true,
    };

    spawn_api_server(config, state).await.unwrap()
}

async fn setup(configs: Vec<AlarmConfig>) -> (Cluster, Instance, SocketAddr) {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");
    cluster.write(
        &vrouter("host1"),
        "NodeStatus",
        &c1,
        "gen1",
        Some(json!({"state": "down"})),
    );

    let instance = Instance::start(&cluster, "a", configs).await;
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;

    let addr = spawn_test_api(&instance).await;
    (cluster, instance, addr)
}

#[tokio::test]
async fn test_health_and_stats() {
    let (_cluster, instance, addr) = setup(vec![down_rule()]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/api/v1/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let stats: Value = client
        .get(format!("http://{addr}/api/v1/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["owned_partitions"], json!([0, 1]));
    assert_eq!(stats["cache"]["uves"], 1);
    assert_eq!(stats["alarms"]["configs"], 1);
    assert_eq!(stats["alarms"]["alarmed_uves"], 1);

    instance.stop().await;
}

#[tokio::test]
async fn test_partitions_and_uves() {
    let (_cluster, instance, addr) = setup(vec![]).await;
    let client = reqwest::Client::new();

    let partitions: Value = client
        .get(format!("http://{addr}/api/v1/partitions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(partitions["partition_count"], 2);
    assert_eq!(partitions["partitions"].as_array().unwrap().len(), 2);
    assert_eq!(partitions["partitions"][0]["phase"], "streaming");
    assert_eq!(partitions["partitions"][0]["info"]["instance_id"], "a");
    assert_eq!(partitions["partitions"][0]["collectors"]["127.0.0.1:0"], "gen1");

    let names: Value = client
        .get(format!("http://{addr}/api/v1/uves/ObjectVRouter"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names["names"], json!(["host1"]));

    let uve: Value = client
        .get(format!("http://{addr}/api/v1/uves/ObjectVRouter/host1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(uve["key"], "ObjectVRouter:host1");
    assert_eq!(uve["contents"]["NodeStatus"]["state"], "down");

    let missing = client
        .get(format!("http://{addr}/api/v1/uves/ObjectVRouter/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    instance.stop().await;
}

#[tokio::test]
async fn test_manual_partition_release() {
    let (_cluster, instance, addr) = setup(vec![]).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/api/v1/partitions/0"))
        .json(&json!({"owned": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    instance.wait_owned(&[1]).await;
    assert!(instance.cache.lookup(&vrouter("host1")).is_none());

    let out_of_range = client
        .post(format!("http://{addr}/api/v1/partitions/7"))
        .json(&json!({"owned": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

    instance.stop().await;
}

#[tokio::test]
async fn test_ack_over_http() {
    let (_cluster, instance, addr) = setup(vec![down_rule()]).await;
    let client = reqwest::Client::new();

    let alarms: Value = client
        .get(format!("http://{addr}/api/v1/alarms"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let record = &alarms["alarms"][0]["alarms"][0];
    assert_eq!(record["alarm_name"], "vrouter-down");
    assert_eq!(record["ack"], false);
    let timestamp = record["timestamp"].as_u64().unwrap();

    let ack = |alarm_name: &str, timestamp: u64| {
        client
            .post(format!("http://{addr}/api/v1/alarms/ack"))
            .json(&json!({
                "table": "ObjectVRouter",
                "name": "host1",
                "alarm_name": alarm_name,
                "timestamp": timestamp,
            }))
            .send()
    };

    let wrong = ack("vrouter-down", timestamp + 1).await.unwrap();
    assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);
    let body: Value = wrong.json().await.unwrap();
    assert_eq!(body["result"], "invalid_request");

    let missing = ack("other", timestamp).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let ok = ack("vrouter-down", timestamp).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let alarms = instance.alarm.alarms().await.unwrap();
    assert!(alarms[0].alarms[0].ack);

    instance.stop().await;
}

#[tokio::test]
async fn test_alarm_config_crud() {
    let (_cluster, instance, addr) = setup(vec![]).await;
    let client = reqwest::Client::new();

    let created = client
        .put(format!("http://{addr}/api/v1/alarm-configs"))
        .json(&down_rule())
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::NO_CONTENT);
    instance.output.flush().await.unwrap();
    assert_eq!(instance.alarm.alarms().await.unwrap().len(), 1);

    let configs: Vec<AlarmConfig> = client
        .get(format!("http://{addr}/api/v1/alarm-configs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(configs, vec![down_rule()]);

    let invalid = client
        .put(format!("http://{addr}/api/v1/alarm-configs"))
        .json(&json!({"name": "empty", "uve_tables": ["ObjectVRouter"], "or_list": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let deleted = client
        .delete(format!("http://{addr}/api/v1/alarm-configs/vrouter-down"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(instance.alarm.alarms().await.unwrap().is_empty());

    let again = client
        .delete(format!("http://{addr}/api/v1/alarm-configs/vrouter-down"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    instance.stop().await;
}

#[tokio::test]
async fn test_stream_forwards_alarm_output() {
    let (cluster, instance, addr) = setup(vec![down_rule()]).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/api/v1/stream")).await.unwrap();

    // host4 hashes to partition 1
    cluster.write(
        &vrouter("host4"),
        "NodeStatus",
        &collector("127.0.0.1"),
        "gen1",
        Some(json!({"state": "down"})),
    );
    instance.settle().await;

    let frame = tokio::time::timeout(std::time::Duration::from_secs(10), socket.next())
        .await
        .expect("no frame")
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    let output: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(output["type"], "update");
    assert_eq!(output["key"]["name"], "host4");

    instance.stop().await;
}
