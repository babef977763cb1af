//! The external boundary: one axum listener serving both the REST surface
//! and the realtime WebSocket channel.

pub mod rest;
pub mod ws;

use anyhow::Result;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(rest::health))
        .route(
            "/sessions",
            get(rest::list_sessions).post(rest::create_session),
        )
        .route(
            "/sessions/{id}",
            get(rest::get_session).delete(rest::delete_session),
        )
        .route("/sessions/{id}/prompt", post(rest::prompt_session))
        .route("/sessions/{id}/stop", post(rest::stop_session))
        .route("/sessions/{id}/archive", post(rest::archive_session))
        .route("/sessions/{id}/unarchive", post(rest::unarchive_session))
        .route("/sessions/{id}/events", get(rest::list_events))
        .route("/sessions/{id}/messages", get(rest::list_messages))
        .route("/sessions/{id}/artifacts", get(rest::list_artifacts))
        .route("/sessions/{id}/sandbox/logs", get(rest::sandbox_logs))
        .route("/sessions/{id}/ws", get(ws::ws_handler))
        .route("/repos", get(rest::list_repos))
        .route("/settings", get(rest::get_settings).put(rest::put_settings))
        .route("/secrets", get(rest::list_global_secrets))
        .route(
            "/secrets/{key}",
            put(rest::put_global_secret).delete(rest::delete_global_secret),
        )
        .route(
            "/repos/{owner}/{name}/secrets",
            get(rest::list_repo_secrets),
        )
        .route(
            "/repos/{owner}/{name}/secrets/{key}",
            put(rest::put_repo_secret).delete(rest::delete_repo_secret),
        )
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve until a shutdown signal arrives, then drain session supervision.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.host, ctx.config.port).parse()?;
    let router = build_router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "control plane listening (REST + WebSocket)");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received — draining sessions");
    ctx.session_manager.drain().await;
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
