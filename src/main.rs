use allstar_telemetry::bootstrap::bootstrap;
use allstar_telemetry::config::Config;
use allstar_telemetry::telemetry;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    telemetry::init(&config.log_filter);

    let bind_addr = config.http_bind_addr.clone();
    let (router, shutdown_tx) = bootstrap(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown_signal());

    if let Err(error) = server.await {
        tracing::error!(%error, "server exited with error");
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Waits for SIGINT (Ctrl-C) or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
