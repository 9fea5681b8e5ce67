//! Persistence layer for Certlane
//!
//! One `Store` trait, two backends: a flat-directory JSON store for single
//! host deployments and a Consul KV store for replicated ones. Besides the
//! account and certificate records, the store carries a timed advisory lease
//! that keeps concurrent replicas from issuing for the same site at once.

pub mod account;
pub mod consul;
pub mod file;
pub mod resource;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use account::{Account, AccountKey};
pub use consul::ConsulStore;
pub use file::FileStore;
pub use resource::{Certificates, ChainCertificate};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by store backends.
///
/// `NotFoundUser` and `NotFoundCertificate` are sentinels, not faults:
/// callers use them to branch into first-time issuance.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found user")]
    NotFoundUser,

    #[error("not found certificate resource")]
    NotFoundCertificate,

    #[error("unknown private key type")]
    UnknownPrivateKeyType,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An existing record failed to decode. Treated as store corruption.
    #[error("decode record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid ca directory url: {0}")]
    CaUrl(#[from] url::ParseError),

    #[error("invalid pem block: {0}")]
    Pem(#[from] pem::PemError),

    #[error("key handling: {0}")]
    Key(#[from] openssl::error::ErrorStack),

    #[error("parse certificate chain: {0}")]
    Chain(String),

    #[error("consul request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("consul response: {0}")]
    Consul(String),
}

impl StoreError {
    /// True when the error means an existing record is unreadable.
    ///
    /// The renewal loop treats these as fatal: silently issuing a fresh
    /// certificate over a corrupt record would mask data loss.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Decode(_) | StoreError::UnknownPrivateKeyType | StoreError::Chain(_)
        )
    }
}

/// Persistence and coordination contract shared by all backends.
///
/// The lease contract is identical across implementations: `lock` succeeds
/// when no lease exists, the caller already holds it, or the existing lease
/// has expired; contention returns `Ok(false)`, never an error. `release`
/// only clears a lease still owned by the caller and never fails on an
/// absent lease.
#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_user(&self, ca_dir: &str, email: &str) -> Result<Account>;

    async fn write_user(&self, ca_dir: &str, account: &Account) -> Result<()>;

    async fn fetch_resource(&self, name: &str) -> Result<Certificates>;

    async fn write_resource(&self, name: &str, resource: &Certificates) -> Result<()>;

    async fn lock(&self, id: &str, timeout: Duration) -> Result<bool>;

    async fn release(&self, id: &str) -> Result<()>;
}

/// Reduce a CA directory url to a filesystem- and KV-safe host token.
///
/// Takes the host (with port, if any) and replaces `:` and `/` with `_` so
/// user keys stay stable across backends.
pub fn sanitize_ca_host(ca_dir: &str) -> Result<String> {
    let parsed = url::Url::parse(ca_dir)?;
    let mut host = parsed.host_str().unwrap_or_default().to_string();
    if let Some(port) = parsed.port() {
        host.push(':');
        host.push_str(&port.to_string());
    }
    Ok(host.replace([':', '/'], "_"))
}

pub(crate) mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
