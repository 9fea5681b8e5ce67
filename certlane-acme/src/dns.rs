//! DNS-01 providers
//!
//! A provider publishes the `_acme-challenge` TXT record for a domain and
//! removes it afterwards. Providers are constructed per renewal from the
//! site's credential pairs; lookups fall back to the process environment so
//! externally injected credentials keep working.

mod cloudflare;
mod httpreq;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use cloudflare::CloudflareProvider;
pub use httpreq::HttpreqProvider;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("unknown dns provider '{0}'")]
    UnknownProvider(String),

    #[error("missing credential {0}")]
    MissingCredential(&'static str),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider api: {0}")]
    Api(String),
}

/// Per-site provider credentials.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    vars: HashMap<String, String>,
}

impl Credentials {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: pairs.into_iter().collect(),
        }
    }

    /// Site pair first, process environment second.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publish `value` as a TXT record at `record`.
    async fn present(&self, record: &str, value: &str) -> Result<(), DnsError>;

    /// Remove the record published by `present`.
    async fn cleanup(&self, record: &str, value: &str) -> Result<(), DnsError>;

    /// How long to wait for the record to propagate before asking the CA
    /// to validate.
    fn propagation_wait(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Resolve a provider by its configured name.
pub fn provider_by_name(
    name: &str,
    credentials: &Credentials,
) -> Result<Arc<dyn DnsProvider>, DnsError> {
    match name {
        "cloudflare" => Ok(Arc::new(CloudflareProvider::new(credentials)?)),
        "httpreq" => Ok(Arc::new(HttpreqProvider::new(credentials)?)),
        other => Err(DnsError::UnknownProvider(other.to_string())),
    }
}
