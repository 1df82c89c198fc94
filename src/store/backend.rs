//! UVE store trait definition

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use super::error::StoreResult;
use crate::{CollectorId, CollectorInfo, UveContents, UveKey};

/// "Who contributes what" manifest of one partition on one collector
///
/// generator -> key -> struct names. Values are not included.
pub type PartitionContents = BTreeMap<String, BTreeMap<UveKey, BTreeSet<String>>>;

/// Trait for UVE store clients
///
/// Reads are eventually consistent with the notification stream: a
/// notification observed after a read reflects a state no older than the read.
///
/// ## Error Handling
///
/// Any call may fail with `StoreError::Unavailable` (retry with backoff) or
/// `StoreError::NotFound` (callers treat it as empty).
#[async_trait]
pub trait UveStore: Send + Sync {
    /// Live collectors with their current generation
    async fn list_collectors(&self) -> StoreResult<Vec<CollectorInfo>>;

    /// Contributions of `collector` to `partition`
    async fn list_partition_contents(
        &self,
        partition: u32,
        collector: &CollectorId,
    ) -> StoreResult<PartitionContents>;

    /// Current merged value of one UVE, optionally restricted to one struct
    async fn get_uve(&self, key: &UveKey, struct_filter: Option<&str>) -> StoreResult<UveContents>;
}
