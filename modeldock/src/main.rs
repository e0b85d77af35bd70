use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modeldock::config::Config;
use modeldock::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modeldock=info,model_fetch=info,tower_http=debug".into())
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    tokio::fs::create_dir_all(&config.models_dir)
        .await
        .with_context(|| format!("cannot create {}", config.models_dir.display()))?;
    tracing::info!("Models directory: {}", config.models_dir.display());

    let state = AppState::new(&config);

    match state.models.check_fetcher().await {
        Ok(version) => tracing::info!("Model fetcher: {}", version),
        Err(e) => tracing::warn!("Model fetcher not found or not executable: {}", e)
    }

    let app = modeldock::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
