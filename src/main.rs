//! Frontline
//!
//! Keeps a warm pool of TLS connections to a set of front IPs and
//! dispatches HTTP requests over them.
//!
//! # Architecture Overview
//!
//! ```text
//!   candidate IPs ─▶ IpQualityTracker ─▶ ConnectionPool ─▶ Dispatcher
//!                        ▲    (lease)     (TLS connector)    │  ▲
//!                        │                                   ▼  │ score
//!                        └──────── close / failure ──── Http1Worker
//!                                                       Http2Worker
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http::Method;

use frontline::config::{load_config, FrontConfig};
use frontline::dispatch::{Dispatcher, TaskRequest};
use frontline::health::{IpQualityTracker, LocalNetwork};
use frontline::lifecycle::Shutdown;
use frontline::net::{RustlsEngine, TlsConnector};
use frontline::observability::{logging, metrics};
use frontline::pool::ConnectionPool;

#[derive(Parser)]
#[command(name = "frontline")]
#[command(about = "Warm TLS front-connection pool and request dispatcher", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to request once the dispatcher is up.
    #[arg(long, requires = "path")]
    host: Option<String>,

    /// Path for the one-shot request.
    #[arg(long)]
    path: Option<String>,

    #[arg(long, default_value = "GET")]
    method: String,

    /// Timeout for the one-shot request, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Seconds between status dumps while running.
    #[arg(long, default_value_t = 0)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => FrontConfig::default(),
    };
    logging::init_logging(&config.observability);
    tracing::info!("frontline v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let network = Arc::new(LocalNetwork::new(config.tracker.network_fail_threshold));
    let tracker = Arc::new(IpQualityTracker::new(config.tracker.clone(), network));
    let ips: Vec<IpAddr> = config
        .candidates
        .ips
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect();
    let added = tracker.add_candidates(ips);
    tracing::info!(
        candidates = added,
        port = config.candidates.port,
        sni = ?config.candidates.sni,
        "Candidates loaded"
    );

    let engine = Arc::new(RustlsEngine::new(&config.tls)?);
    let connector = Arc::new(TlsConnector::new(&config, engine, Arc::clone(&tracker)));
    let pool = Arc::new(ConnectionPool::new(
        config.pool.clone(),
        tracker,
        connector,
        shutdown.subscribe(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&pool), shutdown.clone()));

    let mut handles = pool.start();
    handles.extend(dispatcher.start());

    if let (Some(host), Some(path)) = (&cli.host, &cli.path) {
        let method = Method::from_bytes(cli.method.as_bytes())?;
        let request = TaskRequest::new(method, host.as_str(), path.as_str())
            .timeout(Duration::from_secs(cli.timeout));
        match dispatcher.send(request).await {
            Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
            Err(e) => tracing::error!(host = %host, path = %path, error = %e, "Request failed"),
        }
        println!("{}", serde_json::to_string_pretty(&dispatcher.status())?);
        dispatcher.stop();
    } else {
        let mut signal = shutdown.subscribe();
        let mut ticker = (cli.status_interval > 0)
            .then(|| tokio::time::interval(Duration::from_secs(cli.status_interval)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down");
                    dispatcher.stop();
                    break;
                }
                _ = signal.recv() => break,
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => { ticker.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    println!("{}", serde_json::to_string_pretty(&dispatcher.status())?);
                }
            }
        }
    }

    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
