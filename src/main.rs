//! Pulse Arena Back binary entrypoint wiring the multiplayer hub, the
//! spectator tracker, the replay upload pipeline, and the metadata
//! broadcaster behind one WebSocket surface.

use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_arena_back::{
    config::ServerConfig,
    dao::memory::{InMemoryDatabase, InMemoryScoreStorage},
    routes,
    services::{hub_service, metadata_service},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env();
    let port = config.port();

    // The database and storage ports default to their in-memory
    // implementations; deployments swap in real backends here.
    let app_state = AppState::new(config, InMemoryDatabase::new(), InMemoryScoreStorage::new());

    tokio::spawn(metadata_service::run(app_state.clone()));

    let app = build_router(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal(app_state.clone()))
        .await
        .context("serving axum")?;

    // Drain the upload pipeline before the process exits.
    app_state.uploader().shutdown().await;

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

/// Wait for Ctrl+C or SIGTERM, then close rooms before letting axum drain.
async fn shutdown_signal(state: SharedState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    hub_service::initiate_graceful_shutdown(&state).await;
}
