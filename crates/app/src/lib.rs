//! pod-index service wiring: watch source → ingest → index → HTTP.

#![forbid(unsafe_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use podindex_api::InProcApi;
use podindex_store::{spawn_ingest, IngestHandle, PodIndex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod shutdown;

pub use config::Config;

/// Fatal conditions; each one ends the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to initialise pod watch source")]
    WatchSource(#[source] anyhow::Error),
    #[error("failed to bind HTTP listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("initial pod sync did not complete within {0:?}")]
    SyncTimeout(Duration),
    #[error("HTTP server failed")]
    Serve(#[source] std::io::Error),
    #[error("failed to install signal handlers")]
    Signals(#[source] std::io::Error),
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("POD_INDEX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Install the Prometheus exporter when an address is configured. Failure is not fatal.
pub fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(%addr, error = %e, "failed to install metrics exporter"),
    }
}

/// Serve `app` on `listener` until `stop` is cancelled, then drain in-flight requests.
pub fn serve(listener: TcpListener, app: Router, stop: CancellationToken) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app).with_graceful_shutdown(async move { stop.cancelled().await }).await
    })
}

/// Run the service until a shutdown signal arrives.
pub async fn run(cfg: Config) -> Result<(), StartupError> {
    let client = podindex_kubehub::client().await.map_err(StartupError::WatchSource)?;
    let pods = podindex_kubehub::pod_api(client, cfg.namespace());

    let index = Arc::new(PodIndex::new());
    let (tx, ingest) = spawn_ingest(index.clone(), cfg.queue_cap);
    let watch_task = tokio::spawn(async move {
        if let Err(e) = podindex_kubehub::start_watcher(pods, tx).await {
            error!(error = ?e, "pod watcher stopped");
        }
    });

    let addr = cfg.listen_addr();
    let res = match TcpListener::bind(addr).await {
        Ok(listener) => serve_until(&cfg, index, ingest, listener, shutdown::wait_for_signal()).await,
        Err(source) => {
            ingest.abort();
            Err(StartupError::Bind { addr, source })
        }
    };
    watch_task.abort();
    res
}

/// Serve HTTP on `listener` over `index` and drive the startup and shutdown sequence.
///
/// `/health` answers right away and `/ready` stays 503 until the ingest loop has applied
/// the initial listing, at which point the index is marked synced once. Missing the sync
/// deadline is fatal. After `stop` resolves the server gets the grace period to drain,
/// then open connections are dropped. The ingest loop is aborted on the way out.
pub async fn serve_until<F>(
    cfg: &Config,
    index: Arc<PodIndex>,
    ingest: IngestHandle,
    listener: TcpListener,
    stop: F,
) -> Result<(), StartupError>
where
    F: Future<Output = std::io::Result<()>>,
{
    let api: routes::SharedApi = Arc::new(InProcApi::new(index.clone()));
    let app = routes::router(api.clone(), cfg.basic_auth(), cfg.request_timeout());
    match listener.local_addr() {
        Ok(addr) => info!(%addr, auth = cfg.basic_auth().is_enabled(), "HTTP server listening"),
        Err(e) => warn!(error = %e, "HTTP server listening on unknown address"),
    }

    let token = CancellationToken::new();
    let mut server = serve(listener, app, token.clone());
    tokio::pin!(stop);

    let outcome = tokio::select! {
        synced = ingest.wait_for_initial_sync(cfg.sync_timeout()) => {
            if synced {
                index.mark_synced();
                info!(pods = index.count(), "cache synced successfully");
                Ok(true)
            } else {
                Err(StartupError::SyncTimeout(cfg.sync_timeout()))
            }
        }
        res = &mut stop => {
            info!(initial_sync = ingest.has_completed_initial_sync(), "shutdown requested before the index was synced");
            res.map(|_| false).map_err(StartupError::Signals)
        }
        res = &mut server => Err(server_exit(res)),
    };

    let outcome = match outcome {
        Ok(true) => tokio::select! {
            res = &mut stop => res.map_err(StartupError::Signals),
            res = &mut server => Err(server_exit(res)),
        },
        Ok(false) => Ok(()),
        Err(e) => Err(e),
    };

    info!("shutting down");
    token.cancel();
    if !server.is_finished() {
        match tokio::time::timeout(cfg.shutdown_grace(), &mut server).await {
            Ok(_) => info!("HTTP server drained"),
            Err(_) => {
                warn!(grace_secs = cfg.shutdown_grace_secs, "grace period elapsed; aborting open connections");
                server.abort();
            }
        }
    }
    ingest.abort();
    let stats = api.stats();
    info!(pods = stats.pod_count, synced = stats.synced, "pod index at shutdown");
    outcome
}

fn server_exit(res: Result<std::io::Result<()>, tokio::task::JoinError>) -> StartupError {
    match res {
        Ok(Err(e)) => StartupError::Serve(e),
        Ok(Ok(())) => StartupError::Serve(std::io::Error::other("HTTP server exited unexpectedly")),
        Err(join) => StartupError::Serve(std::io::Error::other(join)),
    }
}
