//! HTTP UVE store client
//!
//! Talks to a JSON gateway in front of the collector-side UVE stores.
//!
//! ## Endpoints
//!
//! - `GET /collectors` - live collectors as `{"id": "addr:port", "generation": ...}`
//! - `GET /partitions/{partition}?collector=addr:port` - contribution manifest
//! - `GET /uve?key=table:name[&struct=name]` - merged UVE contents
//!
//! Several endpoints may be configured; a call fails over to the next
//! endpoint when one is unavailable.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{instrument, trace, warn};

use super::backend::{PartitionContents, UveStore};
use super::error::{StoreError, StoreResult};
use crate::{CollectorId, CollectorInfo, UveContents, UveKey};

/// UVE store reachable over HTTP
pub struct HttpUveStore {
    /// Base URLs (e.g. "http://10.0.0.1:6381")
    endpoints: Vec<String>,

    /// HTTP client (reused across requests)
    client: reqwest::Client,
}

impl HttpUveStore {
    /// Create a client for the given base URLs
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no UVE store endpoints configured".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            client,
        })
    }

    /// GET `path` on each endpoint in turn until one answers
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> StoreResult<T> {
        let mut last_error = StoreError::Unavailable("no endpoint tried".to_string());

        for endpoint in &self.endpoints {
            let url = format!("{endpoint}{path}");
            trace!("GET {url} {query:?}");

            let response = match self.client.get(&url).query(query).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{url}: request failed: {e}");
                    last_error = StoreError::Unavailable(e.to_string());
                    continue;
                }
            };

            match response.status() {
                StatusCode::NOT_FOUND => return Err(StoreError::NotFound(path.to_string())),
                status if status.is_server_error() => {
                    warn!("{url}: HTTP error {status}");
                    last_error = StoreError::Unavailable(format!("HTTP error: {status}"));
                    continue;
                }
                status if !status.is_success() => {
                    return Err(StoreError::Malformed(format!("unexpected HTTP status {status}")));
                }
                _ => {}
            }

            let body = response.text().await?;
            return serde_json::from_str(&body).map_err(StoreError::from);
        }

        Err(last_error)
    }
}

#[async_trait]
impl UveStore for HttpUveStore {
    #[instrument(skip(self))]
    async fn list_collectors(&self) -> StoreResult<Vec<CollectorInfo>> {
        self.get_json("/collectors", &[]).await
    }

    #[instrument(skip(self), fields(collector = %collector))]
    async fn list_partition_contents(
        &self,
        partition: u32,
        collector: &CollectorId,
    ) -> StoreResult<PartitionContents> {
        let collector = collector.to_string();
        let raw: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = self
            .get_json(&format!("/partitions/{partition}"), &[("collector", &collector)])
            .await?;

        let mut contents = PartitionContents::new();
        for (generator, keys) in raw {
            let entry = contents.entry(generator).or_default();
            for (key, structs) in keys {
                let key: UveKey = key.parse().map_err(StoreError::Malformed)?;
                entry.insert(key, structs);
            }
        }
        Ok(contents)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_uve(&self, key: &UveKey, struct_filter: Option<&str>) -> StoreResult<UveContents> {
        let key = key.to_string();
        let mut query = vec![("key", key.as_str())];
        if let Some(filter) = struct_filter {
            query.push(("struct", filter));
        }
        self.get_json("/uve", &query).await
    }
}
