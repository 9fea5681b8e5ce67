//! The `start` subcommand: wire the store, the renewal engine, the sds
//! server and the metrics endpoint together and run until shutdown.

use std::sync::Arc;

use anyhow::Context;
use certlane_acme::{AcmeIssuer, RenewalConfig, RenewalService};
use certlane_xds::XdsServer;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{StartArgs, common, metrics_http};

pub async fn run(args: StartArgs) -> anyhow::Result<()> {
    let sites = certlane_core::config::load_sites_file(&args.config)
        .with_context(|| format!("load sites config from {}", args.config.display()))?;
    tracing::debug!(sites = sites.sites.len(), "sites config loaded");

    let store = common::init_store(&args.store).await?;

    let instance_id = Uuid::new_v4().simple().to_string();
    tracing::info!(
        instance_id = instance_id.as_str(),
        ca_dir = args.ca_dir.as_str(),
        "starting certlane"
    );

    let engine = Arc::new(RenewalService::new(
        RenewalConfig {
            ca_dir: args.ca_dir,
            remain_days: args.cert_days,
            interval: args.interval,
            lock_timeout: args.lock_timeout,
            instance_id,
        },
        sites,
        store,
        Arc::new(AcmeIssuer::new()),
    ));

    certlane_xds::metrics::init();

    // One shutdown signal for every task; flipped by ctrl-c.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Bind both listeners up front so startup failures are immediate.
    let xds_listener = TcpListener::bind(args.xds_listen)
        .await
        .with_context(|| format!("bind xds listener on {}", args.xds_listen))?;
    let metrics_listener = TcpListener::bind(args.metrics_listen)
        .await
        .with_context(|| format!("bind metrics listener on {}", args.metrics_listen))?;

    let updates = engine.subscribe();
    let mut xds_task = tokio::spawn(XdsServer::new().run(
        xds_listener,
        updates,
        shutdown_rx.clone(),
    ));

    tracing::info!(addr = %args.metrics_listen, "start metrics http server");
    let mut metrics_task = tokio::spawn(metrics_http::serve(metrics_listener, shutdown_rx.clone()));

    let loop_engine = engine.clone();
    let mut renewal_task = tokio::spawn(loop_engine.run(shutdown_rx));

    // Synthetic fire: subscribers see the persisted state immediately
    // instead of waiting out the first interval.
    engine.fire_notification().await;

    tokio::select! {
        result = &mut renewal_task => match result.context("renewal loop panicked")? {
            Ok(()) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("renewal loop failed")),
        },
        result = &mut xds_task => match result.context("sds server panicked")? {
            Ok(()) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("sds server failed")),
        },
        result = &mut metrics_task => result
            .context("metrics server panicked")?
            .context("metrics server failed"),
    }
}
