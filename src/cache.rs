//! UVE cache
//!
//! Process-wide, partition-indexed view of every UVE this instance owns.
//!
//! ## Architecture
//!
//! ```text
//! UveCache
//!   └── partition p ──▶ PartitionSlice (own lock, one writer: the partition worker)
//!         ├── uvedb[table][name][struct] = Entry { value, contributor, provisional }
//!         ├── typekeys[struct] = { table:name }
//!         └── keys = { table:name }            (partkeys[p])
//! ```
//!
//! Writes for a key take only its partition's lock, so partition workers
//! never contend with each other. Reads clone what they need out of the
//! slice (copy-on-read) and never hold a lock across an await point.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{CollectorId, Contributor, UveContents, UveKey};

/// Provenance of a partition's contents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionInfo {
    /// Instance that owns the partition
    pub instance_id: String,

    /// Address and port of the owning instance
    pub addr: String,
    pub port: u16,

    pub acquire_time: DateTime<Utc>,
}

/// One cached struct contribution
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub contributor: Contributor,

    /// Written during bootstrap from a collector not yet confirmed live
    pub provisional: bool,
}

/// Result of applying a notification to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Value written (new or changed)
    Updated,

    /// Same value by the same contributor was already cached
    Unchanged,

    /// Struct removed
    Removed,

    /// Removal of a struct that is not cached
    NotPresent,

    /// Removal by a contributor that does not own the cached struct
    ContributorMismatch,

    /// The key's partition is not owned by this instance
    NotOwned,
}

impl ApplyOutcome {
    /// Whether the UVE contents changed
    pub fn changed(self) -> bool {
        matches!(self, ApplyOutcome::Updated | ApplyOutcome::Removed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub partitions: usize,
    pub uves: usize,
    pub structs: usize,
    pub provisional: usize,
}

type StructMap = BTreeMap<String, Entry>;

#[derive(Debug)]
struct PartitionSlice {
    info: PartitionInfo,
    uvedb: BTreeMap<String, BTreeMap<String, StructMap>>,
    typekeys: BTreeMap<String, BTreeSet<UveKey>>,
    keys: BTreeSet<UveKey>,

    /// Bumped on every mutation
    version: u64,
}

impl PartitionSlice {
    fn new(info: PartitionInfo) -> Self {
        Self {
            info,
            uvedb: BTreeMap::new(),
            typekeys: BTreeMap::new(),
            keys: BTreeSet::new(),
            version: 0,
        }
    }

    fn structs(&self, key: &UveKey) -> Option<&StructMap> {
        self.uvedb.get(&key.table)?.get(&key.name)
    }

    fn insert(&mut self, key: &UveKey, struct_name: &str, entry: Entry) -> ApplyOutcome {
        let structs = self
            .uvedb
            .entry(key.table.clone())
            .or_default()
            .entry(key.name.clone())
            .or_default();

        if structs.get(struct_name) == Some(&entry) {
            return ApplyOutcome::Unchanged;
        }

        structs.insert(struct_name.to_string(), entry);
        self.typekeys
            .entry(struct_name.to_string())
            .or_default()
            .insert(key.clone());
        self.keys.insert(key.clone());
        self.version += 1;
        ApplyOutcome::Updated
    }

    fn remove(&mut self, key: &UveKey, struct_name: &str) -> ApplyOutcome {
        let Some(names) = self.uvedb.get_mut(&key.table) else {
            return ApplyOutcome::NotPresent;
        };
        let Some(structs) = names.get_mut(&key.name) else {
            return ApplyOutcome::NotPresent;
        };
        if structs.remove(struct_name).is_none() {
            return ApplyOutcome::NotPresent;
        }

        if structs.is_empty() {
            names.remove(&key.name);
            if names.is_empty() {
                self.uvedb.remove(&key.table);
            }
            self.keys.remove(key);
        }

        if let Some(keys) = self.typekeys.get_mut(struct_name) {
            keys.remove(key);
            if keys.is_empty() {
                self.typekeys.remove(struct_name);
            }
        }

        self.version += 1;
        ApplyOutcome::Removed
    }

    /// `(key, struct)` pairs whose contributor matches `pred`
    fn attributed(&self, pred: impl Fn(&Entry) -> bool) -> Vec<(UveKey, String)> {
        let mut found = Vec::new();
        for (table, names) in &self.uvedb {
            for (name, structs) in names {
                for (struct_name, entry) in structs {
                    if pred(entry) {
                        found.push((UveKey::new(table.clone(), name.clone()), struct_name.clone()));
                    }
                }
            }
        }
        found
    }
}

/// Partition-indexed UVE cache shared by partition workers and the alarm actor
pub struct UveCache {
    partitions: u32,
    slices: RwLock<BTreeMap<u32, Arc<RwLock<PartitionSlice>>>>,
}

impl UveCache {
    /// Create a cache for a cluster running `partitions` partitions
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            slices: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn slice(&self, partition: u32) -> Option<Arc<RwLock<PartitionSlice>>> {
        self.slices.read().get(&partition).cloned()
    }

    fn slice_for(&self, key: &UveKey) -> Option<Arc<RwLock<PartitionSlice>>> {
        self.slice(key.partition(self.partitions))
    }

    fn all_slices(&self) -> Vec<Arc<RwLock<PartitionSlice>>> {
        self.slices.read().values().cloned().collect()
    }

    /// Start holding contents for a partition
    ///
    /// Returns false if the partition was already present (its contents are kept).
    pub fn add_partition(&self, partition: u32, info: PartitionInfo) -> bool {
        let mut slices = self.slices.write();
        if slices.contains_key(&partition) {
            return false;
        }
        debug!("cache: adding partition {partition}");
        slices.insert(partition, Arc::new(RwLock::new(PartitionSlice::new(info))));
        true
    }

    /// Remove a partition and every key in it, returning the removed keys
    pub fn drop_partition(&self, partition: u32) -> Vec<UveKey> {
        let Some(slice) = self.slices.write().remove(&partition) else {
            return Vec::new();
        };
        let keys: Vec<UveKey> = slice.read().keys.iter().cloned().collect();
        debug!("cache: dropped partition {partition} with {} keys", keys.len());
        keys
    }

    pub fn owned_partitions(&self) -> Vec<u32> {
        self.slices.read().keys().copied().collect()
    }

    pub fn partition_info(&self, partition: u32) -> Option<PartitionInfo> {
        Some(self.slice(partition)?.read().info.clone())
    }

    /// Mutation counter of a partition
    pub fn version(&self, partition: u32) -> Option<u64> {
        Some(self.slice(partition)?.read().version)
    }

    /// Write a struct value on behalf of `contributor`
    pub fn insert(
        &self,
        key: &UveKey,
        struct_name: &str,
        value: Value,
        contributor: Contributor,
        provisional: bool,
    ) -> ApplyOutcome {
        let Some(slice) = self.slice_for(key) else {
            return ApplyOutcome::NotOwned;
        };
        trace!("cache: insert {key} {struct_name} by {contributor}");
        slice.write().insert(
            key,
            struct_name,
            Entry {
                value,
                contributor,
                provisional,
            },
        )
    }

    /// Remove a struct
    ///
    /// With a contributor, the struct is removed only if that contributor
    /// wrote the cached value.
    pub fn remove(&self, key: &UveKey, struct_name: &str, contributor: Option<&Contributor>) -> ApplyOutcome {
        let Some(slice) = self.slice_for(key) else {
            return ApplyOutcome::NotOwned;
        };
        let mut slice = slice.write();

        if let Some(contributor) = contributor {
            match slice.structs(key).and_then(|s| s.get(struct_name)) {
                None => return ApplyOutcome::NotPresent,
                Some(entry) if &entry.contributor != contributor => {
                    return ApplyOutcome::ContributorMismatch;
                }
                Some(_) => {}
            }
        }

        trace!("cache: remove {key} {struct_name}");
        slice.remove(key, struct_name)
    }

    /// Apply one notification: a value writes, `None` removes
    pub fn apply(
        &self,
        key: &UveKey,
        struct_name: &str,
        value: Option<Value>,
        contributor: &Contributor,
    ) -> ApplyOutcome {
        match value {
            Some(value) => self.insert(key, struct_name, value, contributor.clone(), false),
            None => self.remove(key, struct_name, Some(contributor)),
        }
    }

    /// Remove everything `collector` contributed to a partition
    ///
    /// With `keep_generation`, entries of that generation survive. Returns
    /// the keys whose contents changed.
    pub fn purge_collector(
        &self,
        partition: u32,
        collector: &CollectorId,
        keep_generation: Option<&str>,
    ) -> Vec<UveKey> {
        let Some(slice) = self.slice(partition) else {
            return Vec::new();
        };
        let mut slice = slice.write();

        let doomed = slice.attributed(|entry| {
            &entry.contributor.collector == collector
                && keep_generation.is_none_or(|keep| entry.contributor.generation != keep)
        });

        let mut changed = BTreeSet::new();
        for (key, struct_name) in doomed {
            slice.remove(&key, &struct_name);
            changed.insert(key);
        }

        if !changed.is_empty() {
            debug!(
                "cache: purged {} keys of collector {collector} from partition {partition}",
                changed.len()
            );
        }
        changed.into_iter().collect()
    }

    /// Clear the provisional mark on a collector's entries in a partition
    pub fn confirm_collector(&self, partition: u32, collector: &CollectorId) -> usize {
        let Some(slice) = self.slice(partition) else {
            return 0;
        };
        let mut slice = slice.write();
        let mut confirmed = 0;
        for names in slice.uvedb.values_mut() {
            for structs in names.values_mut() {
                for entry in structs.values_mut() {
                    if entry.provisional && &entry.contributor.collector == collector {
                        entry.provisional = false;
                        confirmed += 1;
                    }
                }
            }
        }
        confirmed
    }

    /// Merged contents of one UVE
    pub fn lookup(&self, key: &UveKey) -> Option<UveContents> {
        let slice = self.slice_for(key)?;
        let slice = slice.read();
        let structs = slice.structs(key)?;
        Some(
            structs
                .iter()
                .map(|(name, entry)| (name.clone(), entry.value.clone()))
                .collect(),
        )
    }

    /// Cached entries of one UVE, with their contributors
    pub fn entries(&self, key: &UveKey) -> Option<BTreeMap<String, Entry>> {
        let slice = self.slice_for(key)?;
        let slice = slice.read();
        slice.structs(key).cloned()
    }

    /// Every key carrying `struct_name`, across owned partitions
    pub fn iter_by_struct(&self, struct_name: &str) -> Vec<UveKey> {
        let mut keys = BTreeSet::new();
        for slice in self.all_slices() {
            if let Some(found) = slice.read().typekeys.get(struct_name) {
                keys.extend(found.iter().cloned());
            }
        }
        keys.into_iter().collect()
    }

    /// Names of every cached UVE in `table`
    pub fn keys_in_table(&self, table: &str) -> Vec<String> {
        let mut names = BTreeSet::new();
        for slice in self.all_slices() {
            if let Some(found) = slice.read().uvedb.get(table) {
                names.extend(found.keys().cloned());
            }
        }
        names.into_iter().collect()
    }

    /// Every cached key of a partition
    pub fn partition_keys(&self, partition: u32) -> Vec<UveKey> {
        self.slice(partition)
            .map(|slice| slice.read().keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every cached key across owned partitions
    pub fn all_keys(&self) -> Vec<UveKey> {
        let mut keys = Vec::new();
        for slice in self.all_slices() {
            keys.extend(slice.read().keys.iter().cloned());
        }
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for slice in self.all_slices() {
            let slice = slice.read();
            stats.partitions += 1;
            stats.uves += slice.keys.len();
            for names in slice.uvedb.values() {
                for structs in names.values() {
                    stats.structs += structs.len();
                    stats.provisional += structs.values().filter(|e| e.provisional).count();
                }
            }
        }
        stats
    }

    /// Verify partition/key and type-index consistency
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let slices: Vec<(u32, Arc<RwLock<PartitionSlice>>)> = self
            .slices
            .read()
            .iter()
            .map(|(p, s)| (*p, s.clone()))
            .collect();

        for (partition, slice) in slices {
            let slice = slice.read();
            let mut seen = BTreeSet::new();

            for (table, names) in &slice.uvedb {
                for (name, structs) in names {
                    let key = UveKey::new(table.clone(), name.clone());
                    if structs.is_empty() {
                        return Err(format!("{key} cached with no structs"));
                    }
                    if key.partition(self.partitions) != partition {
                        return Err(format!("{key} cached in partition {partition}"));
                    }
                    if !slice.keys.contains(&key) {
                        return Err(format!("{key} missing from partition {partition} keys"));
                    }
                    for struct_name in structs.keys() {
                        let indexed = slice
                            .typekeys
                            .get(struct_name)
                            .is_some_and(|keys| keys.contains(&key));
                        if !indexed {
                            return Err(format!("{key} missing from type index {struct_name}"));
                        }
                    }
                    seen.insert(key);
                }
            }

            if seen != slice.keys {
                return Err(format!("partition {partition} keys list stale entries"));
            }

            for (struct_name, keys) in &slice.typekeys {
                for key in keys {
                    let present = slice
                        .structs(key)
                        .is_some_and(|structs| structs.contains_key(struct_name));
                    if !present {
                        return Err(format!("type index {struct_name} lists absent {key}"));
                    }
                }
            }
        }

        Ok(())
    }
}
