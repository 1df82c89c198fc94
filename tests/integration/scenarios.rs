//! End-to-end scenarios: bootstrap, streaming, rule evaluation and soak timers

use assert_matches::assert_matches;
use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use uve_alarmgen::{
    UveKey,
    actors::messages::AlarmOutput,
    aggregate::{AggregateOp, AggregationConfig},
    asm::{AckResult, MICROS_PER_SEC, Micros},
    ownership::Coordinator,
    rules::{AlarmConfig, AlarmExpression, Operand2, Operation},
};

use crate::helpers::{Cluster, Instance, InstanceOptions, collector, contents, eventually, notification};

fn uve1() -> UveKey {
    UveKey::new("ObjectXX", "uve1")
}

/// Hashes to partition 1 of 2
fn uve4() -> UveKey {
    UveKey::new("ObjectYY", "uve4")
}

fn rule(name: &str, expression: AlarmExpression) -> AlarmConfig {
    AlarmConfig::new(name, &["ObjectYY"], vec![vec![expression]])
}

#[tokio::test]
async fn test_bootstrap_then_stream() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");
    cluster.write(&uve1(), "type1", &c1, "gen1", Some(json!({"xx": 0})));
    cluster.coordinator.set_partition(0, false).await.unwrap();

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[1]).await;
    instance.settle().await;
    assert_eq!(instance.cache.lookup(&uve1()), Some(contents(json!({"type1": {"xx": 0}}))));

    cluster.write(&uve4(), "type2", &c1, "gen1", Some(json!({"yy": 1})));
    instance.settle().await;

    assert_eq!(instance.cache.lookup(&uve4()), Some(contents(json!({"type2": {"yy": 1}}))));
    assert_eq!(instance.cache.partition_keys(1), vec![uve1(), uve4()]);
    assert!(instance.cache.partition_keys(0).is_empty());
    instance.cache.check_invariants().unwrap();

    instance.stop().await;
}

#[tokio::test]
async fn test_late_collector_is_folded_in() {
    let cluster = Cluster::new(2);
    let late = collector("127.0.0.5");

    let instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    instance.settle().await;

    // Not live yet: discarded
    cluster
        .bus
        .publish(&notification(&uve4(), "type2", &late, "gen1", Some(json!({}))));
    instance.settle().await;
    assert!(instance.cache.lookup(&uve4()).is_none());

    cluster.store.add_collector(late.clone(), "gen1");
    cluster.store.put(
        &uve4(),
        "type2",
        uve_alarmgen::Contributor::new(late, "gen1", "g1"),
        json!({"yy": 1}),
    );

    eventually("late collector folded in", || instance.cache.lookup(&uve4()).is_some()).await;
    assert_eq!(instance.cache.lookup(&uve4()), Some(contents(json!({"type2": {"yy": 1}}))));

    instance.stop().await;
}

#[tokio::test]
async fn test_not_null_rule() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let cfg = rule(
        "a-present",
        AlarmExpression::new("A", Operation::Ne, Operand2::Json(json!(null))),
    );
    let mut instance = Instance::start(&cluster, "a", vec![cfg]).await;
    instance.wait_owned(&[0, 1]).await;

    cluster.write(&uve4(), "Other", &c1, "gen1", Some(json!({"z": 1})));
    instance.settle().await;
    assert!(instance.alarm.alarms().await.unwrap().is_empty());

    cluster.write(&uve4(), "A", &c1, "gen1", Some(json!({"B": "x"})));
    instance.settle().await;

    let output = instance.next_alarm_output().await;
    assert_matches!(&output, AlarmOutput::Update(alarms) if alarms.key == uve4());

    let alarms = instance.alarm.alarms().await.unwrap();
    let record = &alarms[0].alarms[0];
    assert_eq!(record.alarm_name, "a-present");
    assert_eq!(record.or_list.0.len(), 1);
    let matches = &record.or_list.0[0].and_list[0].matches;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].op1_json, json!({"B": "x"}));

    instance.stop().await;
}

#[tokio::test]
async fn test_iteration_with_variables() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let cfg = rule(
        "c-differs",
        AlarmExpression::new("A.*.C", Operation::Ne, Operand2::Path("A.*.D".to_string()))
            .with_variables(&["A.__key"]),
    );
    let instance = Instance::start(&cluster, "a", vec![cfg]).await;
    instance.wait_owned(&[0, 1]).await;

    cluster.write(
        &uve4(),
        "A",
        &c1,
        "gen1",
        Some(json!({"abc": {"C": 10, "D": 4}, "def": {"C": 23, "D": 23}})),
    );
    instance.settle().await;

    let alarms = instance.alarm.alarms().await.unwrap();
    let matches = &alarms[0].alarms[0].or_list.0[0].and_list[0].matches;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].op1_json, json!(10));
    assert_eq!(matches[0].op2_json, Some(json!(4)));
    assert_eq!(matches[0].variables_json["A.__key"], json!("abc"));

    instance.stop().await;
}

#[tokio::test]
async fn test_range_rule_raises_and_clears() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let cfg = rule(
        "in-range",
        AlarmExpression::new("A.B.C", Operation::Range, Operand2::Json(json!([500, 1000]))),
    );
    let mut instance = Instance::start(&cluster, "a", vec![cfg]).await;
    instance.wait_owned(&[0, 1]).await;

    cluster.write(&uve4(), "A", &c1, "gen1", Some(json!({"B": {"C": 500}})));
    instance.settle().await;
    assert_matches!(instance.next_alarm_output().await, AlarmOutput::Update(_));

    cluster.write(&uve4(), "A", &c1, "gen1", Some(json!({"B": {"C": 1500}})));
    instance.settle().await;
    assert_eq!(instance.next_alarm_output().await, AlarmOutput::Clear { key: uve4() });
    assert!(instance.alarm.alarms().await.unwrap().is_empty());

    instance.stop().await;
}

#[tokio::test]
async fn test_soak_then_ack() {
    const SEC: Micros = MICROS_PER_SEC;

    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let mut cfg = rule(
        "soaked",
        AlarmExpression::new("A", Operation::Ne, Operand2::Json(json!(null))),
    );
    cfg.active_timer_s = 1;
    cfg.idle_timer_s = 1;

    let mut instance = Instance::start(&cluster, "a", vec![cfg]).await;
    instance.wait_owned(&[0, 1]).await;

    let t0 = Utc::now().timestamp_micros() as Micros;
    cluster.write(&uve4(), "A", &c1, "gen1", Some(json!({"B": "x"})));
    instance.settle().await;

    // Soaking: nothing public yet
    assert!(instance.alarm.alarms().await.unwrap().is_empty());
    assert!(instance.stream.try_recv().is_err());

    let outcome = instance.alarm.run_timers(Some(t0 + SEC + SEC / 2)).await.unwrap();
    assert_eq!(outcome.changed, vec![uve4()]);
    instance.output.flush().await.unwrap();
    assert_matches!(
        instance.next_alarm_output().await,
        AlarmOutput::Update(alarms) if !alarms.alarms[0].ack
    );

    let record = instance.alarm.alarms().await.unwrap()[0].alarms[0].clone();
    let result = instance.alarm.ack(uve4(), "soaked", record.timestamp).await.unwrap();
    assert_eq!(result, AckResult::Success);
    instance.output.flush().await.unwrap();
    assert_matches!(
        instance.next_alarm_output().await,
        AlarmOutput::Update(alarms) if alarms.alarms[0].ack
    );

    // The clear soaks too; the alarm stays public meanwhile
    cluster.write(&uve4(), "A", &c1, "gen1", None);
    instance.settle().await;
    assert_eq!(instance.alarm.alarms().await.unwrap().len(), 1);

    let outcome = instance.alarm.run_timers(Some(t0 + 2 * SEC + SEC / 2)).await.unwrap();
    assert_eq!(outcome.changed, vec![uve4()]);
    instance.output.flush().await.unwrap();
    assert_eq!(instance.next_alarm_output().await, AlarmOutput::Clear { key: uve4() });

    let outcome = instance.alarm.run_timers(Some(t0 + 4 * SEC)).await.unwrap();
    assert_eq!(outcome.deleted, vec![(uve4(), "soaked".to_string())]);
    assert_eq!(instance.alarm.stats().await.unwrap().machines, 0);

    instance.stop().await;
}

#[tokio::test]
async fn test_aggregate_over_partitions() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let mut instance = Instance::start_with(
        &cluster,
        "a",
        InstanceOptions {
            aggregations: vec![AggregationConfig {
                table: "ObjectVRouter".to_string(),
                struct_name: "VrouterStats".to_string(),
                field: "flows".to_string(),
                op: AggregateOp::Sum,
            }],
            ..Default::default()
        },
    )
    .await;
    instance.wait_owned(&[0, 1]).await;

    // host1 hashes to partition 0, host4 to partition 1
    for (host, flows) in [("host1", 10), ("host4", 5)] {
        let key = UveKey::new("ObjectVRouter", host);
        cluster.write(&key, "VrouterStats", &c1, "gen1", Some(json!({"flows": flows})));
    }
    instance.settle().await;

    let aggregates = instance.alarm.aggregates().await.unwrap();
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].value, json!(15));
    assert_eq!(aggregates[0].count, 2);

    let mut last = None;
    while let Ok(output) = instance.stream.try_recv() {
        if let AlarmOutput::Aggregate(record) = output {
            last = Some(record);
        }
    }
    assert_eq!(last.map(|record| record.value), Some(json!(15)));

    instance.stop().await;
}

#[tokio::test]
async fn test_rule_update_resweeps_cache() {
    let cluster = Cluster::new(2);
    let c1 = collector("127.0.0.1");
    cluster.store.add_collector(c1.clone(), "gen1");

    let mut instance = Instance::start(&cluster, "a", vec![]).await;
    instance.wait_owned(&[0, 1]).await;
    cluster.write(&uve4(), "A", &c1, "gen1", Some(json!({"B": "x"})));
    instance.settle().await;
    assert!(instance.alarm.alarms().await.unwrap().is_empty());

    let cfg = rule(
        "late-rule",
        AlarmExpression::new("A.B", Operation::Eq, Operand2::Json(json!("x"))),
    );
    instance.alarm.set_config(cfg).await.unwrap();
    instance.output.flush().await.unwrap();
    assert_matches!(instance.next_alarm_output().await, AlarmOutput::Update(_));

    assert!(instance.alarm.delete_config("late-rule").await.unwrap());
    instance.output.flush().await.unwrap();
    assert_eq!(instance.next_alarm_output().await, AlarmOutput::Clear { key: uve4() });

    instance.stop().await;
}
