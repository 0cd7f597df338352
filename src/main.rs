use std::sync::Arc;

use couchscope::broker;
use couchscope::platform::{InClusterClient, PlatformClient};
use couchscope::registry::{ClusterRegistry, ClusterWatcher};
use couchscope::server::{self, AppState};
use couchscope::{Error, GatewayConfig, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = GatewayConfig::load()?.validate()?;

    init_observability(&settings);

    // Shutdown signal shared by every background task
    let (graceful_tx, graceful_rx) = watch::channel(());

    let platform: Arc<dyn PlatformClient> = Arc::new(
        InClusterClient::from_cluster_env().map_err(Error::Platform)?,
    );

    let (dispatcher, broker_state) =
        broker::build(Arc::clone(&platform), settings.watch_namespace.clone());
    let registry = Arc::new(ClusterRegistry::new(broker_state.sender()));

    tokio::spawn(dispatcher.run(graceful_rx.clone()));

    let watcher = ClusterWatcher::new(
        Arc::clone(&platform),
        Arc::clone(&registry),
        settings.watch_namespace.clone(),
    );
    tokio::spawn(watcher.run(graceful_rx.clone()));

    tokio::spawn(async move {
        graceful_shutdown(graceful_tx).await;
    });

    let app = server::router(AppState {
        broker: broker_state,
        registry,
        http: reqwest::Client::new(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .map_err(Error::Http)?;
    info!(listen_addr = %settings.listen_addr, "Server started");

    let mut shutdown_rx = graceful_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .map_err(Error::Http)?;

    info!("Server stopped");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) {
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT detected"),
        _ = sigterm.recv() => info!("SIGTERM detected"),
    }

    if graceful_tx.send(()).is_err() {
        error!("Failed to send shutdown signal");
    }
}

fn init_observability(settings: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level().to_string().to_lowercase()));
    let layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(layer).init();
}
