//! kuview: a read-only bridge from cluster state to browser-consumable SSE.

use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use kube::Client;
use kuview_server::AppState;
use tokio::task::JoinSet;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kuview", version, about = "Cluster state over SSE")]
struct Cli {
    /// Listen address for the HTTP server
    #[arg(long = "listen", default_value = "0.0.0.0:8001")]
    listen: SocketAddr,

    /// Directory served under /static
    #[arg(long = "static-dir", default_value = "dist")]
    static_dir: String,
}

fn init_tracing() {
    let env = std::env::var("KUVIEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUVIEW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUVIEW_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    // In-cluster service account or local kubeconfig, whichever is present.
    let client = Client::try_default().await.context("loading cluster config")?;

    let queue_cap = std::env::var("KUVIEW_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(256);
    let (emitter, hub) = kuview_hub::spawn(queue_cap);

    let mut watchers: JoinSet<Result<()>> = JoinSet::new();
    for spec in kuview_core::default_kinds() {
        watchers.spawn(kuview_watch::start_watcher(client.clone(), spec, emitter.clone()));
    }

    let poller = tokio::spawn(kuview_metrics::run(client.clone(), emitter.clone()));

    let app = kuview_server::router(AppState { hub, client }, &cli.static_dir);
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(listen = %cli.listen, "kuview serving");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        res = async { server.await } => res.context("http server")?,
        Some(res) = watchers.join_next() => {
            // Watch tasks run until shutdown; any early return means a kind
            // can no longer be served and the process must not run partial.
            poller.abort();
            watchers.shutdown().await;
            match res {
                Ok(Ok(())) => bail!("watch task exited unexpectedly"),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(anyhow!(e)).context("watch task panicked"),
            }
        }
    }

    info!("shutting down");
    poller.abort();
    watchers.shutdown().await;
    drop(emitter);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received");
}
