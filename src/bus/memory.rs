//! In-memory notification bus
//!
//! Keeps one append-only log per partition plus committed offsets. Used in
//! standalone mode and by tests that publish notifications directly.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use super::codec::{Notification, RawRecord};
use super::error::{BusError, BusResult};
use super::source::NotificationSource;

#[derive(Debug, Default)]
struct BusState {
    logs: Vec<Vec<RawRecord>>,
    committed: Vec<u64>,
    fail_next: usize,
}

/// In-memory partitioned log
pub struct MemoryBus {
    partitions: u32,
    state: RwLock<BusState>,

    /// Bumped on every append to wake waiting fetches
    appended: watch::Sender<u64>,
}

impl MemoryBus {
    pub fn new(partitions: u32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            partitions,
            state: RwLock::new(BusState {
                logs: vec![Vec::new(); partitions as usize],
                committed: vec![0; partitions as usize],
                fail_next: 0,
            }),
            appended,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Publish a notification to the partition of its key
    ///
    /// Returns `(partition, offset)` of the appended record.
    pub fn publish(&self, notification: &Notification) -> (u32, u64) {
        let partition = notification.key.partition(self.partitions);
        let offset = self.publish_raw(
            partition,
            notification.wire_key(),
            notification.wire_value(),
            &notification.generation,
        );
        (partition, offset)
    }

    /// Append a raw record to a partition log
    pub fn publish_raw(&self, partition: u32, key: String, value: Vec<u8>, generation: &str) -> u64 {
        let offset = {
            let mut state = self.state.write();
            let log = &mut state.logs[partition as usize];
            let offset = log.len() as u64;
            trace!("append p{partition}@{offset}: {key}");
            log.push(RawRecord {
                partition,
                offset,
                key,
                value,
                generation: generation.to_string(),
            });
            offset
        };
        self.appended.send_modify(|count| *count += 1);
        offset
    }

    /// Number of records in a partition log
    pub fn end_offset(&self, partition: u32) -> u64 {
        self.state
            .read()
            .logs
            .get(partition as usize)
            .map_or(0, |log| log.len() as u64)
    }

    /// Fail the next `count` fetches with `BusError::Unavailable`
    pub fn fail_next(&self, count: usize) {
        self.state.write().fail_next = count;
    }

    fn check_partition(&self, partition: u32) -> BusResult<()> {
        if partition >= self.partitions {
            return Err(BusError::UnknownPartition(partition));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for MemoryBus {
    async fn fetch(&self, partition: u32, from_offset: u64, max: usize) -> BusResult<Vec<RawRecord>> {
        self.check_partition(partition)?;
        let mut appended = self.appended.subscribe();

        loop {
            {
                let mut state = self.state.write();
                if state.fail_next > 0 {
                    state.fail_next -= 1;
                    return Err(BusError::Unavailable("injected failure".to_string()));
                }

                let log = &state.logs[partition as usize];
                let start = from_offset as usize;
                if start < log.len() {
                    let end = log.len().min(start + max.max(1));
                    return Ok(log[start..end].to_vec());
                }
            }

            if appended.changed().await.is_err() {
                return Err(BusError::Closed);
            }
        }
    }

    async fn committed_offset(&self, partition: u32) -> BusResult<u64> {
        self.check_partition(partition)?;
        Ok(self.state.read().committed[partition as usize])
    }

    async fn commit(&self, partition: u32, offset: u64) -> BusResult<()> {
        self.check_partition(partition)?;
        let mut state = self.state.write();
        let committed = &mut state.committed[partition as usize];
        *committed = (*committed).max(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{CollectorId, UveKey};

    fn notification(table: &str, name: &str) -> Notification {
        Notification {
            key: UveKey::new(table, name),
            struct_name: "type1".to_string(),
            generator: "g1".to_string(),
            collector: CollectorId::new("127.0.0.1", 0),
            generation: "gen1".to_string(),
            value: Some(json!({"xx": 0})),
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_key_partition() {
        let bus = MemoryBus::new(2);
        let (partition, offset) = bus.publish(&notification("ObjectXX", "uve1"));

        assert_eq!(partition, 1);
        assert_eq!(offset, 0);
        assert_eq!(bus.end_offset(1), 1);
        assert_eq!(bus.end_offset(0), 0);

        let records = bus.fetch(1, 0, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(Notification::decode(&records[0]).unwrap(), notification("ObjectXX", "uve1"));
    }

    #[tokio::test]
    async fn test_fetch_waits_for_append() {
        let bus = Arc::new(MemoryBus::new(2));

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.fetch(1, 0, 10).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        bus.publish(&notification("ObjectXX", "uve1"));
        let records = waiter.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let bus = MemoryBus::new(2);
        bus.commit(0, 5).await.unwrap();
        bus.commit(0, 3).await.unwrap();
        assert_eq!(bus.committed_offset(0).await.unwrap(), 5);
        assert!(matches!(bus.commit(7, 1).await, Err(BusError::UnknownPartition(7))));
    }
}
