//! Consul KV store
//!
//! Replicated backend over the Consul HTTP API. Layout under the key
//! prefix: `user/<ca-host>-<email>.json`, `resource/<site>.json`, and a
//! `leader` key holding the lease as `{"Id": ..., "Limit": RFC3339}`.
//!
//! Lease writes are compare-and-swap on the KV ModifyIndex, so a lost race
//! reads back as `lock -> false` instead of silently stealing the lease.
//! This is the backend to run when more than one replica shares a store.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Account, Certificates, Result, Store, StoreError, sanitize_ca_host};

const DEFAULT_HTTP_ADDR: &str = "http://127.0.0.1:8500";

pub struct ConsulStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Value")]
    value: Option<String>,

    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "Limit")]
    limit: DateTime<Utc>,
}

impl ConsulStore {
    /// Build a client from `CONSUL_HTTP_ADDR` / `CONSUL_HTTP_TOKEN`, with
    /// the agent's standard defaults.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let base_url = std::env::var("CONSUL_HTTP_ADDR")
            .unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string())
            .trim_end_matches('/')
            .to_string();
        let token = std::env::var("CONSUL_HTTP_TOKEN").ok();
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token,
            prefix: prefix.into().trim_matches('/').to_string(),
        })
    }

    fn user_key(&self, ca_dir: &str, email: &str) -> Result<String> {
        let host = sanitize_ca_host(ca_dir)?;
        Ok(format!("{}/user/{host}-{email}.json", self.prefix))
    }

    fn resource_key(&self, name: &str) -> String {
        format!("{}/resource/{name}.json", self.prefix)
    }

    fn lease_key(&self) -> String {
        format!("{}/leader", self.prefix)
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{key}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }

    /// Fetch a key; `None` when absent. Returns the decoded value and the
    /// ModifyIndex needed for CAS writes.
    async fn kv_get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let response = self.authorized(self.http.get(self.kv_url(key))).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pairs: Vec<KvPair> = response.error_for_status()?.json().await?;
        let Some(pair) = pairs.into_iter().next() else {
            return Ok(None);
        };
        let value = match pair.value {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| StoreError::Consul(format!("invalid base64 value for {key}: {e}")))?,
            None => Vec::new(),
        };
        Ok(Some((value, pair.modify_index)))
    }

    /// Put a key. With `cas`, the write only lands when the ModifyIndex
    /// still matches (`cas=0` means "create only"); the result says whether
    /// it did.
    async fn kv_put(&self, key: &str, value: Vec<u8>, cas: Option<u64>) -> Result<bool> {
        let mut url = self.kv_url(key);
        if let Some(index) = cas {
            url.push_str(&format!("?cas={index}"));
        }
        let text = self
            .authorized(self.http.put(url).body(value))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text.trim() == "true")
    }

    async fn kv_delete(&self, key: &str, cas: Option<u64>) -> Result<bool> {
        let mut url = self.kv_url(key);
        if let Some(index) = cas {
            url.push_str(&format!("?cas={index}"));
        }
        let text = self
            .authorized(self.http.delete(url))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text.trim() == "true")
    }
}

#[async_trait]
impl Store for ConsulStore {
    async fn fetch_user(&self, ca_dir: &str, email: &str) -> Result<Account> {
        let key = self.user_key(ca_dir, email)?;
        let Some((value, _)) = self.kv_get(&key).await? else {
            return Err(StoreError::NotFoundUser);
        };
        serde_json::from_slice(&value).map_err(StoreError::Decode)
    }

    async fn write_user(&self, ca_dir: &str, account: &Account) -> Result<()> {
        let key = self.user_key(ca_dir, &account.email)?;
        let content = serde_json::to_vec_pretty(account).map_err(StoreError::Encode)?;
        self.kv_put(&key, content, None).await?;
        Ok(())
    }

    async fn fetch_resource(&self, name: &str) -> Result<Certificates> {
        let Some((value, _)) = self.kv_get(&self.resource_key(name)).await? else {
            return Err(StoreError::NotFoundCertificate);
        };
        serde_json::from_slice(&value).map_err(StoreError::Decode)
    }

    async fn write_resource(&self, name: &str, resource: &Certificates) -> Result<()> {
        let content = serde_json::to_vec_pretty(resource).map_err(StoreError::Encode)?;
        self.kv_put(&self.resource_key(name), content, None).await?;
        Ok(())
    }

    async fn lock(&self, id: &str, timeout: Duration) -> Result<bool> {
        let key = self.lease_key();
        let current = self.kv_get(&key).await?;

        let (lease, cas) = match &current {
            Some((value, index)) => {
                let lease: LeaseRecord =
                    serde_json::from_slice(value).map_err(StoreError::Decode)?;
                (Some(lease), *index)
            }
            // cas=0 closes the create race: only one replica wins the put.
            None => (None, 0),
        };

        if let Some(lease) = &lease {
            let alive = Utc::now() < lease.limit;
            if lease.id != id && alive {
                return Ok(false);
            }
            if lease.id != id {
                tracing::debug!(holder = lease.id.as_str(), "reclaiming stale lease");
            }
        }

        let next = LeaseRecord {
            id: id.to_string(),
            limit: Utc::now()
                + chrono::Duration::from_std(timeout)
                    .map_err(|e| StoreError::Consul(format!("lock timeout out of range: {e}")))?,
        };
        let content = serde_json::to_vec_pretty(&next).map_err(StoreError::Encode)?;
        self.kv_put(&key, content, Some(cas)).await
    }

    async fn release(&self, id: &str) -> Result<()> {
        let key = self.lease_key();
        let Some((value, index)) = self.kv_get(&key).await? else {
            return Ok(());
        };
        let lease: LeaseRecord = serde_json::from_slice(&value).map_err(StoreError::Decode)?;
        if lease.id != id {
            return Ok(());
        }
        // A lost delete race means someone already reclaimed the lease.
        self.kv_delete(&key, Some(index)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountKey;

    /// Mirrors the file-store suite against a real agent.
    /// Run with `cargo test -- --ignored` next to `consul agent -dev`.
    #[tokio::test]
    #[ignore = "requires a local consul agent"]
    async fn consul_store_round_trips_and_lease() {
        let prefix = format!("certlane/test-{}", Utc::now().timestamp());
        let store = ConsulStore::new(&prefix).unwrap();

        const STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
        let account = Account::new("test@example.com", AccountKey::generate_p256().unwrap());
        store.write_user(STAGING, &account).await.unwrap();

        let fetched = store.fetch_user(STAGING, "test@example.com").await.unwrap();
        assert_eq!(fetched.email, account.email);
        assert_eq!(fetched.key.to_der().unwrap(), account.key.to_der().unwrap());

        let resource = Certificates {
            domain: "example.com".into(),
            cert_url: "cert_url".into(),
            cert_stable_url: "cert_stable_url".into(),
            private_key: b"private_key".to_vec(),
            certificate: b"certificate".to_vec(),
            issuer_certificate: b"issuer_certificate".to_vec(),
            csr: b"csr".to_vec(),
        };
        store.write_resource("example", &resource).await.unwrap();
        assert_eq!(store.fetch_resource("example").await.unwrap(), resource);

        let timeout = Duration::from_millis(100);
        assert!(store.lock("a", timeout).await.unwrap());
        assert!(!store.lock("b", timeout).await.unwrap());
        tokio::time::sleep(timeout).await;
        assert!(store.lock("b", timeout).await.unwrap());
        assert!(!store.lock("a", timeout).await.unwrap());
        store.release("b").await.unwrap();
        assert!(store.lock("a", timeout).await.unwrap());
    }
}
