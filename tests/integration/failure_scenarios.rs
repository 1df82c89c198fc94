//! Transient failures, malformed input and collector restarts

use pretty_assertions::assert_eq;
use serde_json::json;
use uve_alarmgen::{UveKey, bus::NotificationSource};

use crate::helpers::{Cluster, Instance, collector, contents, eventually};

fn uve4() -> UveKey {
    UveKey::new("ObjectYY", "uve4")
}

#[tokio::test]
async fn test_store_outage_during_bootstrap_is_retried() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");
    cluster.write(&uve4(), "type2", &c1, "gen1", Some(json!({"yy": 1})));

    let instance = Instance::start(&cluster, "a", vec![]).await;
    cluster.store.fail_next(2);
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;

    eventually("bootstrap after store outage", || instance.cache.lookup(&uve4()).is_some()).await;
    instance.stop().await;
}

#[tokio::test]
async fn test_bus_outage_is_retried() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;

    cluster.bus.fail_next(2);
    cluster.write(&uve4(), "type2", &c1, "gen1", Some(json!({"yy": 1})));
    instance.settle().await;

    assert_eq!(instance.cache.lookup(&uve4()), Some(contents(json!({"type2": {"yy": 1}}))));
    instance.stop().await;
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    cluster.write(&uve4(), "type2", &c1, "gen1", Some(json!({"yy": 1})));
    instance.settle().await;

    // Bad key, then a bad payload for a cached struct
    cluster.bus.publish_raw(1, "no-separators".to_string(), b"{}".to_vec(), "gen1");
    cluster.bus.publish_raw(
        1,
        format!("{}|type2|g1|127.0.0.1:0", uve4()),
        b"{not json".to_vec(),
        "gen1",
    );
    cluster.write(&uve4(), "type3", &c1, "gen1", Some(json!({"zz": 2})));
    instance.settle().await;

    assert_eq!(
        instance.cache.lookup(&uve4()),
        Some(contents(json!({"type2": {"yy": 1}, "type3": {"zz": 2}})))
    );
    assert_eq!(
        cluster.bus.committed_offset(1).await.unwrap(),
        cluster.bus.end_offset(1)
    );
    instance.stop().await;
}

#[tokio::test]
async fn test_collector_restart_purges_old_generation() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    let uve5 = UveKey::new("ObjectYY", "uve5");
    cluster.store.add_collector(c1.clone(), "gen1");
    cluster.write(&uve4(), "type2", &c1, "gen1", Some(json!({"yy": 1})));
    cluster.write(&uve5, "type2", &c1, "gen1", Some(json!({"yy": 2})));

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;
    assert!(instance.cache.lookup(&uve5).is_some());

    // The restarted collector only republishes uve4
    cluster.store.add_collector(c1.clone(), "gen2");
    cluster.write(&uve4(), "type2", &c1, "gen2", Some(json!({"yy": 3})));
    instance.settle().await;

    eventually("old generation purged", || instance.cache.lookup(&uve5).is_none()).await;
    assert_eq!(instance.cache.lookup(&uve4()), Some(contents(json!({"type2": {"yy": 3}}))));

    for key in instance.cache.all_keys() {
        for entry in instance.cache.entries(&key).unwrap().values() {
            assert_eq!(entry.contributor.generation, "gen2");
        }
    }

    // Late records of the old generation are stale
    cluster
        .bus
        .publish(&crate::helpers::notification(&uve5, "type2", &c1, "gen1", Some(json!({"yy": 9}))));
    instance.settle().await;
    assert!(instance.cache.lookup(&uve5).is_none());

    instance.stop().await;
}

#[tokio::test]
async fn test_removed_collector_is_purged() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    let c2 = collector("127.0.0.2");
    cluster.store.add_collector(c1.clone(), "gen1");
    cluster.store.add_collector(c2.clone(), "gen1");
    cluster.write(&uve4(), "type1", &c1, "gen1", Some(json!({"a": 1})));
    cluster.write(&uve4(), "type2", &c2, "gen1", Some(json!({"b": 2})));

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;
    assert_eq!(instance.cache.lookup(&uve4()).unwrap().len(), 2);

    cluster.store.remove_collector(&c2);
    eventually("removed collector purged", || {
        instance.cache.lookup(&uve4()).is_some_and(|uve| uve.len() == 1)
    })
    .await;
    assert_eq!(instance.cache.lookup(&uve4()), Some(contents(json!({"type1": {"a": 1}}))));

    instance.stop().await;
}
