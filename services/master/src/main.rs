// master: HomeBrew DMR master server daemon.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "master", about = "HomeBrew DMR master server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/hblink/master.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "master starting"
    );

    let cfg = match master::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let (emitter, emitter_handle) = match cfg.global.dashboard.clone() {
        Some(dashboard) => {
            let (emitter, handle) = master::events::spawn(dashboard);
            (emitter, Some(handle))
        }
        None => (master::EventEmitter::disabled(), None),
    };

    let server = match master::Master::bind(cfg, emitter).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(2);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;

    // Best-effort flush of queued dashboard events.
    if let Some(handle) = emitter_handle {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
    info!("shutdown complete");
}
