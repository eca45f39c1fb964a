//! Remote coordination backend speaking the etcd v3 JSON gateway.
//!
//! Keys and values travel base64-encoded. TTLs are implemented with leases,
//! and lock acquisition is a single `create_revision == 0` transaction, so the
//! server is the only arbiter of ownership.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::backend::{BackendKind, CoordinationBackend, LockRecord};
use crate::error::{StoreError, StoreResult};
use crate::file::validate_key;

/// Connection settings for an etcd endpoint.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Base URL of the JSON gateway, e.g. `http://127.0.0.1:2379`.
    pub endpoint: String,
    /// Prefix prepended to every key so several deployments can share a cluster.
    pub namespace: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl EtcdConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "/modgate/".to_string(),
            request_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    key: &'a str,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<&'a str>,
}

/// Coordination backend served by an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdBackend {
    client: reqwest::Client,
    config: EtcdConfig,
}

impl EtcdBackend {
    /// Build a client and verify the endpoint answers `/health`.
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn connect(config: EtcdConfig) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("http client: {e}")))?;
        let backend = Self { client, config };
        backend.health().await?;
        info!("connected to etcd");
        Ok(backend)
    }

    /// Check cluster health.
    pub async fn health(&self) -> StoreResult<()> {
        let url = format!("{}/health", self.config.endpoint.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "etcd health check returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp.json().await.map_err(unavailable)?;
        match body.get("health").and_then(|h| h.as_str()) {
            Some("true") => Ok(()),
            other => Err(StoreError::Unavailable(format!(
                "etcd reports unhealthy: {other:?}"
            ))),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}locks/{}", self.config.namespace, key)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> StoreResult<T> {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!(
                "etcd {path} returned {status}: {text}"
            )));
        }
        resp.json::<T>().await.map_err(unavailable)
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<String> {
        let resp: LeaseGrantResponse = self
            .call("/v3/lease/grant", json!({ "TTL": ttl.as_secs().max(1) }))
            .await?;
        Ok(resp.id)
    }

    async fn range_one(&self, full_key: &str) -> StoreResult<Option<Vec<u8>>> {
        let resp: RangeResponse = self
            .call("/v3/kv/range", json!({ "key": B64.encode(full_key) }))
            .await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => {
                let raw = kv.value.unwrap_or_default();
                let bytes = B64
                    .decode(raw)
                    .map_err(|e| StoreError::Corrupt(format!("etcd value for {full_key}: {e}")))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn delete_full(&self, full_key: &str) -> StoreResult<()> {
        let _: serde_json::Value = self
            .call("/v3/kv/deleterange", json!({ "key": B64.encode(full_key) }))
            .await?;
        Ok(())
    }
}

fn unavailable(err: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("etcd request failed: {err}"))
}

/// Smallest key strictly greater than every key starting with `prefix`.
pub(crate) fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: "\0" asks etcd for all keys >= key.
    vec![0]
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Etcd
    }

    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        validate_key(key)?;
        let lease = match ttl {
            Some(ttl) => Some(self.grant_lease(ttl).await?),
            None => None,
        };
        let full = B64.encode(self.full_key(key));
        let encoded = B64.encode(serde_json::to_vec(&value)?);
        let body = serde_json::to_value(PutRequest {
            key: &full,
            value: &encoded,
            lease: lease.as_deref(),
        })?;
        let _: serde_json::Value = self.call("/v3/kv/put", body).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        match self.range_one(&self.full_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.delete_full(&self.full_key(key)).await
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let range_end = prefix_range_end(full_prefix.as_bytes());
        let resp: RangeResponse = self
            .call(
                "/v3/kv/range",
                json!({
                    "key": B64.encode(&full_prefix),
                    "range_end": B64.encode(range_end),
                    "keys_only": true,
                }),
            )
            .await?;

        let lock_prefix = format!("{}locks/", self.config.namespace);
        let mut keys = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            let raw = B64
                .decode(&kv.key)
                .map_err(|e| StoreError::Corrupt(format!("etcd key: {e}")))?;
            let full = String::from_utf8(raw)
                .map_err(|e| StoreError::Corrupt(format!("etcd key utf8: {e}")))?;
            if full.starts_with(&lock_prefix) && !prefix.starts_with("locks/") {
                continue;
            }
            if let Some(stripped) = full.strip_prefix(&self.config.namespace) {
                keys.push(stripped.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn try_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        validate_key(key)?;
        let lock_key = B64.encode(self.lock_key(key));
        let record = LockRecord::new(holder, ttl);
        let value = B64.encode(serde_json::to_vec(&record)?);

        // Lease expiry removes abandoned locks server-side, so the one retry
        // only covers a lease that lapsed between grant and transaction.
        for attempt in 0..2 {
            let lease = self.grant_lease(ttl).await?;
            let resp: TxnResponse = self
                .call(
                    "/v3/kv/txn",
                    json!({
                        "compare": [{
                            "key": lock_key,
                            "result": "EQUAL",
                            "target": "CREATE",
                            "create_revision": "0",
                        }],
                        "success": [{
                            "request_put": { "key": lock_key, "value": value, "lease": lease }
                        }],
                    }),
                )
                .await?;
            if resp.succeeded {
                return Ok(true);
            }
            match self.lock_info(key).await? {
                Some(_) => return Ok(false),
                None if attempt == 0 => debug!(key = %key, "lock vanished, retrying once"),
                None => {}
            }
        }
        Ok(false)
    }

    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<()> {
        let full = self.lock_key(key);
        match self.range_one(&full).await? {
            None => Ok(()),
            Some(bytes) => {
                let record: Option<LockRecord> = serde_json::from_slice(&bytes).ok();
                match record {
                    Some(r) if r.holder != holder && !r.is_expired() => {
                        Err(StoreError::NotLockHolder {
                            key: key.to_string(),
                            holder: holder.to_string(),
                        })
                    }
                    _ => self.delete_full(&full).await,
                }
            }
        }
    }

    async fn lock_info(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        match self.range_one(&self.lock_key(key)).await? {
            Some(bytes) => Ok(serde_json::from_slice::<LockRecord>(&bytes)
                .ok()
                .filter(|r| !r.is_expired())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end(b"modules/"), b"modules0".to_vec());
    }

    #[test]
    fn range_end_carries_over_ff() {
        assert_eq!(prefix_range_end(&[b'a', 0xff]), vec![b'b']);
        assert_eq!(prefix_range_end(&[0xff, 0xff]), vec![0]);
    }

    #[test]
    fn config_defaults() {
        let cfg = EtcdConfig::new("http://127.0.0.1:2379");
        assert_eq!(cfg.namespace, "/modgate/");
        assert_eq!(cfg.request_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unavailable() {
        let cfg = EtcdConfig::new("http://127.0.0.1:1")
            .with_request_timeout(Duration::from_millis(500));
        match EtcdBackend::connect(cfg).await {
            Err(StoreError::Unavailable(_)) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
    }
}
