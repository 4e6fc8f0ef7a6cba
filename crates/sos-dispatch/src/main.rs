use sos_dispatch::config::Settings;
use sos_dispatch::{Backends, Service};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting SOS dispatch server");

    let settings = Settings::new().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let addr = settings.listen_addr();
    let backends = Backends::in_memory(&settings);
    let service = Service::start(settings, backends).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting server on http://{}", addr);

    axum::serve(listener, service.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
