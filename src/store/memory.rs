//! In-memory UVE store (no persistence)
//!
//! This backend keeps collectors and their contributions in process memory.
//! It's useful for:
//! - Standalone runs without an external store
//! - Tests that need to script collector restarts and outages

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use super::backend::{PartitionContents, UveStore};
use super::error::{StoreError, StoreResult};
use crate::{CollectorId, CollectorInfo, Contributor, UveContents, UveKey};

#[derive(Debug, Default)]
struct StoreState {
    /// Collectors known to the store, with their generation
    collectors: BTreeMap<CollectorId, String>,

    /// Collectors that are registered but cannot be reached
    unreachable: BTreeSet<CollectorId>,

    /// key -> struct -> (contributor, value)
    uves: BTreeMap<UveKey, BTreeMap<String, (Contributor, Value)>>,

    /// Fail the next N calls with `Unavailable`
    fail_next: usize,
}

/// In-memory UVE store
pub struct MemoryUveStore {
    partitions: u32,
    state: RwLock<StoreState>,
}

impl MemoryUveStore {
    /// Create an empty store for a cluster running `partitions` partitions
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Register (or restart) a collector with a generation
    ///
    /// A generation change drops everything the old generation contributed.
    pub fn add_collector(&self, collector: CollectorId, generation: impl Into<String>) {
        let generation = generation.into();
        let mut state = self.state.write();
        if let Some(old) = state.collectors.insert(collector.clone(), generation.clone())
            && old != generation
        {
            debug!("collector {collector} restarted ({old} -> {generation})");
            Self::drop_contributions(&mut state, &collector);
        }
    }

    /// Remove a collector and everything it contributed
    pub fn remove_collector(&self, collector: &CollectorId) {
        let mut state = self.state.write();
        state.collectors.remove(collector);
        state.unreachable.remove(collector);
        Self::drop_contributions(&mut state, collector);
    }

    /// Mark a collector as unreachable without removing it from the live set
    pub fn set_unreachable(&self, collector: &CollectorId, unreachable: bool) {
        let mut state = self.state.write();
        if unreachable {
            state.unreachable.insert(collector.clone());
        } else {
            state.unreachable.remove(collector);
        }
    }

    /// Fail the next `count` calls with `StoreError::Unavailable`
    pub fn fail_next(&self, count: usize) {
        self.state.write().fail_next = count;
    }

    /// Write a struct contribution
    pub fn put(&self, key: &UveKey, struct_name: &str, contributor: Contributor, value: Value) {
        trace!("store put {key} {struct_name} by {contributor}");
        self.state
            .write()
            .uves
            .entry(key.clone())
            .or_default()
            .insert(struct_name.to_string(), (contributor, value));
    }

    /// Delete a struct contribution
    pub fn delete(&self, key: &UveKey, struct_name: &str) {
        let mut state = self.state.write();
        if let Some(structs) = state.uves.get_mut(key) {
            structs.remove(struct_name);
            if structs.is_empty() {
                state.uves.remove(key);
            }
        }
    }

    fn drop_contributions(state: &mut StoreState, collector: &CollectorId) {
        state.uves.retain(|_, structs| {
            structs.retain(|_, (contributor, _)| &contributor.collector != collector);
            !structs.is_empty()
        });
    }

    fn check_available(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UveStore for MemoryUveStore {
    async fn list_collectors(&self) -> StoreResult<Vec<CollectorInfo>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .collectors
            .iter()
            .map(|(id, generation)| CollectorInfo {
                id: id.clone(),
                generation: generation.clone(),
            })
            .collect())
    }

    async fn list_partition_contents(
        &self,
        partition: u32,
        collector: &CollectorId,
    ) -> StoreResult<PartitionContents> {
        self.check_available()?;
        let state = self.state.read();

        if state.unreachable.contains(collector) {
            return Err(StoreError::Unavailable(format!("collector {collector} unreachable")));
        }
        if !state.collectors.contains_key(collector) {
            return Err(StoreError::NotFound(format!("collector {collector}")));
        }

        let mut contents = PartitionContents::new();
        for (key, structs) in &state.uves {
            if key.partition(self.partitions) != partition {
                continue;
            }
            for (struct_name, (contributor, _)) in structs {
                if &contributor.collector != collector {
                    continue;
                }
                contents
                    .entry(contributor.generator.clone())
                    .or_default()
                    .entry(key.clone())
                    .or_default()
                    .insert(struct_name.clone());
            }
        }

        Ok(contents)
    }

    async fn get_uve(&self, key: &UveKey, struct_filter: Option<&str>) -> StoreResult<UveContents> {
        self.check_available()?;
        let state = self.state.read();

        let Some(structs) = state.uves.get(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };

        let contents: UveContents = structs
            .iter()
            .filter(|(name, (contributor, _))| {
                struct_filter.is_none_or(|filter| filter == name.as_str())
                    && !state.unreachable.contains(&contributor.collector)
            })
            .map(|(name, (_, value))| (name.clone(), value.clone()))
            .collect();

        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn collector(addr: &str) -> CollectorId {
        CollectorId::new(addr, 0)
    }

    fn contributor(addr: &str, generation: &str, generator: &str) -> Contributor {
        Contributor::new(collector(addr), generation, generator)
    }

    #[tokio::test]
    async fn test_partition_contents_filter_by_partition_and_collector() {
        let store = MemoryUveStore::new(2);
        store.add_collector(collector("127.0.0.1"), "gen1");
        store.add_collector(collector("127.0.0.2"), "gen1");

        let in_p1 = UveKey::new("ObjectXX", "uve1");
        let in_p0 = UveKey::new("ObjectYY", "uve2");
        store.put(&in_p1, "type1", contributor("127.0.0.1", "gen1", "g1"), json!({"xx": 0}));
        store.put(&in_p0, "type2", contributor("127.0.0.1", "gen1", "g1"), json!({"yy": 1}));
        store.put(&in_p1, "type3", contributor("127.0.0.2", "gen1", "g2"), json!({"zz": 2}));

        let contents = store
            .list_partition_contents(1, &collector("127.0.0.1"))
            .await
            .unwrap();

        assert_eq!(contents.len(), 1);
        let keys = &contents["g1"];
        assert_eq!(keys.len(), 1);
        assert!(keys[&in_p1].contains("type1"));
    }

    #[tokio::test]
    async fn test_get_uve_merges_structs_and_applies_filter() {
        let store = MemoryUveStore::new(2);
        store.add_collector(collector("127.0.0.1"), "gen1");
        let key = UveKey::new("ObjectXX", "uve1");
        store.put(&key, "type1", contributor("127.0.0.1", "gen1", "g1"), json!({"a": 1}));
        store.put(&key, "type2", contributor("127.0.0.1", "gen1", "g2"), json!({"b": 2}));

        let all = store.get_uve(&key, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = store.get_uve(&key, Some("type2")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one["type2"], json!({"b": 2}));

        let missing = store.get_uve(&UveKey::new("ObjectXX", "nope"), None).await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_generation_change_drops_old_contributions() {
        let store = MemoryUveStore::new(2);
        store.add_collector(collector("127.0.0.1"), "gen1");
        let key = UveKey::new("ObjectXX", "uve1");
        store.put(&key, "type1", contributor("127.0.0.1", "gen1", "g1"), json!({}));

        store.add_collector(collector("127.0.0.1"), "gen2");

        assert!(store.get_uve(&key, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let store = MemoryUveStore::new(2);
        let c = collector("127.0.0.1");
        store.add_collector(c.clone(), "gen1");
        store.set_unreachable(&c, true);

        let err = store.list_partition_contents(0, &c).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_unreachable(&c, false);
        store.fail_next(1);
        assert!(store.list_collectors().await.is_err());
        assert_eq!(store.list_collectors().await.unwrap().len(), 1);
    }
}
