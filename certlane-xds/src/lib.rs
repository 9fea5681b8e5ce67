//! Secret Discovery Service for Certlane
//!
//! Serves the current certificate set to envoy (and compatible) proxies
//! over the xDS v3 SDS protocol: a versioned in-memory snapshot, rebuilt
//! from each renewal notification, pushed to every connected stream.

pub mod metrics;
pub mod proto;
pub mod server;
pub mod snapshot;

use thiserror::Error;

pub use server::{SdsService, XdsServer};
pub use snapshot::{DEFAULT_NODE_HASH, SECRET_TYPE_URL, Snapshot, SnapshotCache, build_snapshot};

#[derive(Debug, Error)]
pub enum XdsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("grpc transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("invalid certificate bundle for '{domain}': {reason}")]
    InvalidBundle { domain: String, reason: String },
}
