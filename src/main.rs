use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskreminder::api::router;
use taskreminder::clock::system_clock;
use taskreminder::config::Config;
use taskreminder::db;
use taskreminder::delivery::RoutingGateway;
use taskreminder::services::ReminderScheduler;
use taskreminder::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "taskreminder=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::new_from_env()?;
    let pool = db::connect(&config.database_url).await?;

    let gateway = Arc::new(RoutingGateway::from_config(
        config.push.as_ref(),
        config.email.as_ref(),
    )?);
    let state = AppState::new(
        pool,
        gateway,
        system_clock(),
        &config.scan,
        config.day_boundary,
    );

    let shutdown = CancellationToken::new();
    let scheduler = ReminderScheduler::spawn(
        state.scanner.clone(),
        config.scan.interval,
        shutdown.child_token(),
    );

    let app = router(state);

    info!("listening on http://{}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    scheduler.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
