//! Prometheus metrics for the SDS server

use std::sync::LazyLock;

use certlane_core::PROMETHEUS_NAMESPACE;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Streams opened against the SDS server
pub static XDS_STREAM_OPEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::with_opts(
        Opts::new("xds_stream_open", "Number of opened xds streams")
            .namespace(PROMETHEUS_NAMESPACE),
    )
    .expect("metric can be created")
});

/// Register all metrics. Repeated registration is ignored.
pub fn init() {
    let _ = REGISTRY.register(Box::new(XDS_STREAM_OPEN.clone()));
}

/// Gather metrics in Prometheus text format
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
