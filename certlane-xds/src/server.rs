//! SDS gRPC server
//!
//! One task pumps renewal notifications into the snapshot cache; the gRPC
//! runtime drives one task per stream. A stream gets a response whenever
//! its acked version differs from the cache, and again on every cache bump.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};

use certlane_core::notification::NotificationReceiver;

use crate::proto::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use crate::proto::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use crate::snapshot::{DEFAULT_NODE_HASH, SnapshotCache, build_snapshot, node_hash};
use crate::{XdsError, metrics};

pub struct XdsServer {
    cache: Arc<SnapshotCache>,
}

impl XdsServer {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(SnapshotCache::new()),
        }
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }

    /// Serve SDS on `listener` until `shutdown` flips, applying every
    /// notification from `updates` to the snapshot cache.
    ///
    /// A snapshot that fails to build ends the process: subscribers must
    /// never have a good snapshot silently replaced by a corrupt one.
    pub async fn run(
        self,
        listener: TcpListener,
        updates: NotificationReceiver,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), XdsError> {
        let pump_cache = self.cache.clone();
        let mut pump_updates = updates;
        let mut pump_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = pump_updates.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let notification = pump_updates.borrow_and_update().clone();
                        let Some(notification) = notification else {
                            continue;
                        };
                        match build_snapshot(&notification) {
                            Ok(snapshot) => {
                                tracing::info!(
                                    version = snapshot.version.as_str(),
                                    secrets = snapshot.secrets.len(),
                                    "applying sds snapshot"
                                );
                                pump_cache.set_snapshot(DEFAULT_NODE_HASH, snapshot);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "snapshot application failed");
                                std::process::exit(1);
                            }
                        }
                    }
                    _ = pump_shutdown.changed() => {
                        if *pump_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "starting sds grpc server");

        let mut signal_rx = shutdown;
        let signal = async move {
            let _ = signal_rx.wait_for(|stop| *stop).await;
        };

        tonic::transport::Server::builder()
            .add_service(SecretDiscoveryServiceServer::new(SdsService::new(self.cache)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await?;
        Ok(())
    }
}

impl Default for XdsServer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SdsService {
    cache: Arc<SnapshotCache>,
}

impl SdsService {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for SdsService {
    type StreamSecretsStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        metrics::XDS_STREAM_OPEN.inc();
        tracing::debug!(metadata = ?request.metadata(), "sds stream opened");

        let mut inbound = request.into_inner();
        let cache = self.cache.clone();
        let mut versions = cache.subscribe();
        let (tx, rx) = mpsc::channel::<Result<DiscoveryResponse, Status>>(4);

        tokio::spawn(async move {
            let mut sent_version: Option<String> = None;
            let mut names: Vec<String> = Vec::new();
            loop {
                tokio::select! {
                    message = inbound.message() => {
                        let request = match message {
                            Ok(Some(request)) => request,
                            Ok(None) => break,
                            Err(status) => {
                                tracing::debug!(error = %status, "sds stream closed");
                                break;
                            }
                        };
                        names = request.resource_names.clone();
                        let Some(snapshot) = cache.get(node_hash(request.node.as_ref())) else {
                            // Nothing published yet; the version bump will
                            // cover this subscriber once a snapshot lands.
                            continue;
                        };
                        if request.version_info != snapshot.version {
                            if tx.send(Ok(snapshot.response(&names))).await.is_err() {
                                break;
                            }
                            sent_version = Some(snapshot.version.clone());
                        }
                    }
                    changed = versions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(snapshot) = cache.get(DEFAULT_NODE_HASH) else {
                            continue;
                        };
                        if sent_version.as_deref() != Some(snapshot.version.as_str()) {
                            if tx.send(Ok(snapshot.response(&names))).await.is_err() {
                                break;
                            }
                            sent_version = Some(snapshot.version.clone());
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let request = request.into_inner();
        let snapshot = self
            .cache
            .get(node_hash(request.node.as_ref()))
            .ok_or_else(|| Status::unavailable("no secret snapshot available yet"))?;
        Ok(Response::new(snapshot.response(&request.resource_names)))
    }
}
