use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scheduled_transfers::{bootstrap, config::AppConfig, server};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,scheduled_transfers=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown requested, stopping executors...");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting scheduled transfer service");

    let config = AppConfig::from_env()?;
    let app = bootstrap::initialize_application(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor_handles: Vec<_> = app
        .executor_loops
        .into_iter()
        .map(|executor_loop| executor_loop.spawn(shutdown_rx.clone()))
        .collect();

    let router = server::create_app(app.state, &config.server);
    server::run_server(router, &config.server.bind_address, shutdown_signal(shutdown_tx)).await?;

    // Executors finish their current cycle before exiting
    for handle in executor_handles {
        if let Err(e) = handle.await {
            error!("Executor task ended abnormally: {}", e);
        }
    }

    info!("👋 Shutdown complete");
    Ok(())
}
