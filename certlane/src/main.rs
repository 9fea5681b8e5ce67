//! Certlane - keeps a fleet of edge proxies supplied with live TLS material
//!
//! This is the main entry point for the Certlane CLI.

mod common;
mod export;
mod metrics_http;
mod start;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Certlane - ACME certificate control plane with SDS delivery
#[derive(Parser)]
#[command(name = "certlane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StoreKind {
    File,
    Consul,
}

/// Flags shared by every subcommand that opens the store.
#[derive(Args)]
pub struct StoreArgs {
    /// Storage backend
    #[arg(long, env = "STORE", default_value = "file")]
    pub store: StoreKind,

    /// Base directory for the file store
    #[arg(long, env = "STORE_FILE_BASE", default_value = "./data")]
    pub store_file_base: PathBuf,

    /// Key prefix for the consul store
    #[arg(long, env = "STORE_CONSUL_PREFIX", default_value = "certlane/default")]
    pub store_consul_prefix: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the renewal loop and the sds server
    Start(StartArgs),

    /// Export certificate and key files for named sites from the store
    Export(ExportArgs),
}

#[derive(Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// ACME directory url of the issuing CA
    #[arg(
        long,
        env = "CA_DIR",
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    pub ca_dir: String,

    /// Renew when this many days or fewer remain on a certificate
    #[arg(long, env = "CERT_DAYS", default_value_t = 25)]
    pub cert_days: i64,

    /// Pause between renewal sweeps
    #[arg(long, env = "INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Advisory lease lifetime
    #[arg(long, env = "LOCK_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub lock_timeout: Duration,

    /// Sites configuration file
    #[arg(long, short = 'c', env = "CONFIG_FILE", default_value = "sites.yaml")]
    pub config: PathBuf,

    /// Listen address for the sds grpc server
    #[arg(long, env = "XDS_LISTEN", default_value = "127.0.0.1:20000")]
    pub xds_listen: SocketAddr,

    /// Listen address for prometheus metrics
    #[arg(long, env = "METRICS_LISTEN", default_value = "127.0.0.1:20001")]
    pub metrics_listen: SocketAddr,
}

#[derive(Args)]
pub struct ExportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Site name to export (repeatable)
    #[arg(long, required = true)]
    pub name: Vec<String>,

    /// Output directory
    #[arg(long, default_value = ".")]
    pub dest: PathBuf,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json())
            .with(filter)
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match cli.command {
        Commands::Start(args) => start::run(args).await,
        Commands::Export(args) => export::run(args).await,
    }
}
