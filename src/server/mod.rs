//! HTTP surface of the relay
//!
//! A single axum router serves both sides of the mesh: nodes upgrade
//! `/v1/tunnel` to a websocket, REST clients post to `/v1/forward`.

pub mod routes;
pub mod tunnel;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::registry::ConnectionRegistry;
use crate::relay::RequestDispatcher;

/// State shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub dispatcher: RequestDispatcher,
    /// Cancelled on shutdown; open tunnels watch it so the server can drain
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(dispatcher: RequestDispatcher, shutdown: CancellationToken) -> Self {
        Self {
            registry: dispatcher.registry().clone(),
            dispatcher,
            shutdown,
        }
    }
}

/// Build the relay router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tunnel", get(tunnel::upgrade))
        .route("/v1/forward", post(routes::forward))
        .route("/v1/ping", get(routes::ping))
        .route("/v1/status", get(routes::status))
        .route("/v1/version", get(routes::version))
        .route("/v1/peers", get(routes::peers))
        .fallback(routes::forbidden)
        .with_state(state)
}

/// Serve until the shutdown token is cancelled
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read relay listen address")?;
    let shutdown = state.shutdown.clone();

    log::info!("Mesh relay listening on {addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("Relay server terminated unexpectedly")?;

    log::info!("Mesh relay stopped");
    Ok(())
}
