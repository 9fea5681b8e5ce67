//! Versioned secret snapshots
//!
//! The cache holds one snapshot per node bucket; this control plane
//! collapses all subscribers into the single bucket `"default"`. Writers
//! (the notification pump) replace snapshots whole; readers (streams)
//! clone the `Arc` and a watch counter tells them when to re-read.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message as _;
use tokio::sync::watch;

use certlane_core::Notification;

use crate::XdsError;
use crate::proto::envoy::config::core::v3::{DataSource, Node, data_source};
use crate::proto::envoy::extensions::transport_sockets::tls::v3::{
    Secret, TlsCertificate, secret,
};
use crate::proto::envoy::service::discovery::v3::DiscoveryResponse;

/// Every subscriber is treated as interchangeable.
pub const DEFAULT_NODE_HASH: &str = "default";

/// Type url carried on SDS resources.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// Collapse a node identity into its cache bucket.
pub fn node_hash(_node: Option<&Node>) -> &'static str {
    DEFAULT_NODE_HASH
}

/// A consistent, versioned set of secrets.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Unix seconds at build time, as a decimal string.
    pub version: String,
    pub secrets: Vec<Secret>,
}

impl Snapshot {
    /// Render the snapshot as a discovery response, optionally filtered to
    /// the requested resource names.
    pub fn response(&self, names: &[String]) -> DiscoveryResponse {
        let resources = self
            .secrets
            .iter()
            .filter(|secret| names.is_empty() || names.iter().any(|name| *name == secret.name))
            .map(|secret| prost_types::Any {
                type_url: SECRET_TYPE_URL.to_string(),
                value: secret.encode_to_vec(),
            })
            .collect();
        DiscoveryResponse {
            version_info: self.version.clone(),
            resources,
            canary: false,
            type_url: SECRET_TYPE_URL.to_string(),
            nonce: self.version.clone(),
        }
    }
}

/// Build a snapshot from a renewal notification.
///
/// Every bundle's PEM chain is parsed up front: a bundle the proxies could
/// not load must never make it into the cache, so a malformed one fails the
/// whole build and the caller treats that as fatal.
pub fn build_snapshot(notification: &Notification) -> Result<Snapshot, XdsError> {
    let mut secrets = Vec::with_capacity(notification.certificates.len());
    for bundle in &notification.certificates {
        let chain = bundle
            .extract_certificates()
            .map_err(|e| XdsError::InvalidBundle {
                domain: bundle.domain.clone(),
                reason: e.to_string(),
            })?;
        if chain.is_empty() {
            return Err(XdsError::InvalidBundle {
                domain: bundle.domain.clone(),
                reason: "empty certificate chain".to_string(),
            });
        }

        secrets.push(Secret {
            name: bundle.domain.clone(),
            r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
                certificate_chain: Some(DataSource {
                    specifier: Some(data_source::Specifier::InlineBytes(
                        bundle.certificate.clone(),
                    )),
                }),
                private_key: Some(DataSource {
                    specifier: Some(data_source::Specifier::InlineBytes(
                        bundle.private_key.clone(),
                    )),
                }),
            })),
        });
    }

    Ok(Snapshot {
        version: chrono::Utc::now().timestamp().to_string(),
        secrets,
    })
}

/// Shared snapshot cache: many concurrent readers, one writer.
pub struct SnapshotCache {
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
    version_tx: watch::Sender<u64>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            snapshots: RwLock::new(HashMap::new()),
            version_tx,
        }
    }

    pub fn set_snapshot(&self, node: &str, snapshot: Snapshot) {
        self.snapshots
            .write()
            .insert(node.to_string(), Arc::new(snapshot));
        self.version_tx.send_modify(|generation| *generation += 1);
    }

    pub fn get(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.read().get(node).cloned()
    }

    /// Wakes whenever any snapshot is replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
