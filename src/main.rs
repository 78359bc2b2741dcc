//! Match relay binary entrypoint wiring the WebSocket hub, login routes and heartbeat ticker.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use match_relay::{
    config::AppConfig,
    routes,
    services::{auth::ConfigAuthenticator, heartbeat},
    state::{AppState, SharedState},
};

/// Environment variable holding the HS256 secret session tokens are signed with.
const JWT_SECRET_ENV: &str = "RELAY_JWT_SECRET";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let secret = env::var(JWT_SECRET_ENV).with_context(|| format!("{JWT_SECRET_ENV} must be set"))?;
    if secret.trim().is_empty() {
        bail!("{JWT_SECRET_ENV} must not be empty");
    }

    let config = AppConfig::load();
    let authenticator = Arc::new(ConfigAuthenticator::new(
        secret.as_bytes(),
        config.accounts.clone(),
    ));
    let app_state = AppState::new(config, authenticator);

    let ticker = heartbeat::spawn(app_state.clone());
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting relay hub");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    ticker.abort();
    info!("relay hub stopped");
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
