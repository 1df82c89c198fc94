//! Partition ownership across instances: rebalance, release and failover

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use uve_alarmgen::{
    UveKey,
    actors::messages::AlarmOutput,
    rules::{AlarmConfig, AlarmExpression, Operand2, Operation},
};

use crate::helpers::{Cluster, Instance, InstanceOptions, collector, eventually};

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

/// host1 lands on partition 0, host4 on partition 1
fn seed(cluster: &Cluster) {
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");
    for host in ["host1", "host4"] {
        cluster.write(&vrouter(host), "NodeStatus", &c1, "gen1", Some(json!({"state": "down"})));
    }
}

#[tokio::test]
async fn test_second_instance_takes_over_half() {
    let cluster = Cluster::new(2);
    seed(&cluster);

    let mut a = Instance::start(&cluster, "a", vec![down_rule()]).await;
    a.wait_owned(&[0, 1]).await;
    a.settle().await;
    assert_eq!(a.alarm.alarms().await.unwrap().len(), 2);

    let b = Instance::start(&cluster, "b", vec![down_rule()]).await;
    a.wait_owned(&[0]).await;
    b.wait_owned(&[1]).await;
    b.settle().await;

    // a dropped partition 1 with its keys and alarms
    assert!(a.cache.partition_keys(1).is_empty());
    assert!(a.cache.lookup(&vrouter("host4")).is_none());
    let a_alarms: Vec<UveKey> = a.alarm.alarms().await.unwrap().into_iter().map(|u| u.key).collect();
    assert_eq!(a_alarms, vec![vrouter("host1")]);

    let mut cleared = false;
    while let Ok(output) = a.stream.try_recv() {
        if output == (AlarmOutput::Clear { key: vrouter("host4") }) {
            cleared = true;
        }
    }
    assert!(cleared, "released alarm was not cleared");

    // b bootstrapped partition 1 from the store
    assert!(b.cache.lookup(&vrouter("host4")).is_some());
    let b_alarms: Vec<UveKey> = b.alarm.alarms().await.unwrap().into_iter().map(|u| u.key).collect();
    assert_eq!(b_alarms, vec![vrouter("host4")]);

    a.cache.check_invariants().unwrap();
    b.cache.check_invariants().unwrap();

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_failover_after_instance_stops() {
    let cluster = Cluster::new(2);
    seed(&cluster);

    let a = Instance::start(&cluster, "a", vec![down_rule()]).await;
    a.wait_owned(&[0, 1]).await;
    let b = Instance::start(&cluster, "b", vec![down_rule()]).await;
    b.wait_owned(&[1]).await;

    b.stop().await;
    a.wait_owned(&[0, 1]).await;
    a.settle().await;

    assert!(a.cache.lookup(&vrouter("host4")).is_some());
    assert_eq!(a.alarm.alarms().await.unwrap().len(), 2);

    a.stop().await;
}

#[tokio::test]
async fn test_manual_release_and_acquire() {
    let cluster = Cluster::new(2);
    seed(&cluster);

    let a = Instance::start(&cluster, "a", vec![]).await;
    a.wait_owned(&[0, 1]).await;
    a.settle().await;

    a.ownership.set_partition(0, false).await.unwrap();
    a.wait_owned(&[1]).await;
    assert!(a.cache.lookup(&vrouter("host1")).is_none());

    a.ownership.set_partition(0, true).await.unwrap();
    a.wait_owned(&[0, 1]).await;
    a.settle().await;
    assert!(a.cache.lookup(&vrouter("host1")).is_some());

    a.stop().await;
}

#[tokio::test]
async fn test_coordination_outage_beyond_grace_is_fatal() {
    let cluster = Cluster::new(2);
    seed(&cluster);

    let a = Instance::start_with(
        &cluster,
        "a",
        InstanceOptions {
            session_grace: Some(Duration::from_millis(200)),
            ..Default::default()
        },
    )
    .await;
    a.wait_owned(&[0, 1]).await;

    cluster.coordinator.set_available(false);

    let reason = tokio::time::timeout(Duration::from_secs(10), a.manager.fatal())
        .await
        .expect("outage was not fatal");
    assert!(!reason.is_empty());
    eventually("partitions dropped", || a.cache.owned_partitions().is_empty()).await;
}
