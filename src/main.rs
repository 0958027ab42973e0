use clap::Parser;
use plug_dutycycle::{
    api::{self, AppState},
    checkpoint::CheckpointStore,
    cli::Cli,
    clock::{Clock, SystemClock},
    kasa::KasaClient,
    metrics::Exporter,
    CollectionScheduler, DeviceRegistry,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting plug-dutycycle");

    let cfg = Cli::parse().into_config()?;
    let collector = &cfg.collector;
    info!(
        targets = ?collector.targets,
        threshold_watts = collector.threshold_watts,
        checkpoint_file = ?collector.checkpoint_file,
        "configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = CheckpointStore::new(collector.checkpoint_file.clone());
    let restored = store
        .load(clock.now(), collector.checkpoint_max_age())
        .await;
    let devices = Arc::new(DeviceRegistry::new(
        collector.targets.iter().cloned(),
        collector.threshold_watts,
        restored,
    ));

    let mut scheduler =
        CollectionScheduler::new(collector, devices.clone(), store, clock.clone());
    for addr in &collector.targets {
        let client = KasaClient::new(addr, cfg.device.default_port);
        scheduler = scheduler.with_client(addr.clone(), Arc::new(client));
    }

    let exporter = Arc::new(Exporter::new(devices.clone(), clock)?);
    let router = api::create_router(AppState { devices, exporter });

    let addr = cfg.http.listen_address.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "failed to bind metrics listener");
        anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
    })?;
    info!("will listen on {}", addr);

    let (stop, stopped) = oneshot::channel::<()>();
    let collector_handle = tokio::spawn(scheduler.run(async move {
        let _ = stopped.await;
    }));

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HTTP server error");
    }

    let _ = stop.send(());
    if let Err(e) = collector_handle.await {
        error!(error = %e, "collector task failed");
    }

    info!("Application shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
