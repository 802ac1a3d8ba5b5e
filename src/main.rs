use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use inventory_api::{
    api_router, config, db,
    events::outbox::OutboxDispatcher,
    message_queue,
    services::{reconciliation::ReconciliationWorker, wms_outbound::WmsOutboundWorker},
    wms, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;
    config::init_tracing(&config.log_level);

    tracing::info!(environment = %config.environment, "Starting inventory API server...");

    let db_arc = Arc::new(db::establish_connection_from_app_config(&config).await?);
    if config.auto_migrate {
        db::run_migrations(&db_arc).await?;
    }

    let queue = message_queue::connect(&config.broker_url)
        .await
        .map_err(|e| anyhow::anyhow!("broker connect failed: {e}"))?;
    let wms_client =
        wms::build_client(&config.wms).map_err(|e| anyhow::anyhow!("WMS client: {e}"))?;

    // Background workers share one shutdown channel and stop when it flips.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = OutboxDispatcher::new(
        db_arc.clone(),
        queue.clone(),
        config.outbox_batch_size,
        Duration::from_millis(config.outbox_poll_interval_ms),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let outbound = WmsOutboundWorker::new(
        db_arc.clone(),
        queue.clone(),
        wms_client.clone(),
        config.outbound_prefetch,
    );
    let outbound_handle = tokio::spawn(outbound.run(shutdown_rx.clone()));

    let reconciliation = ReconciliationWorker::new(
        db_arc.clone(),
        queue.clone(),
        wms_client.clone(),
        config.sync_prefetch,
    );
    let reconciliation_handle = tokio::spawn(reconciliation.run(shutdown_rx));

    let state = AppState::new(db_arc.clone(), config.clone(), queue);
    let app = api_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(CorsLayer::permissive()),
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("inventory API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown in reverse construction order: intake has stopped, now the
    // workers, then the pool.
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(dispatcher_handle, outbound_handle, reconciliation_handle);

    if let Ok(pool) = Arc::try_unwrap(db_arc) {
        let _ = db::close_pool(pool).await;
    }

    tracing::info!("inventory API shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
