use clap::Parser;
use podindex_app::{init_metrics, init_tracing, run, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();
    let cfg = Config::parse();
    init_metrics(cfg.metrics_addr);
    info!(config = ?cfg, "starting pod-index");

    if let Err(e) = run(cfg).await {
        error!(error = ?anyhow::Error::new(e), "pod-index failed");
        std::process::exit(1);
    }
    info!("pod-index stopped");
}
