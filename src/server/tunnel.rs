//! Websocket glue for node tunnels

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::registry::RegistryError;
use crate::relay::{SessionError, TunnelSession};

/// `GET /v1/tunnel`: a node opens its tunnel
///
/// The peer is identified by the socket's remote address.
pub(super) async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip().to_string();
    let port = addr.port();

    let session = match TunnelSession::on_connect(&state.registry, &ip, port) {
        Ok(session) => session,
        Err(e) => {
            log::warn!("Rejecting tunnel from {addr}: {e}");
            let status = match &e {
                SessionError::Contended { .. } => StatusCode::CONFLICT,
                SessionError::Registry(RegistryError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
                SessionError::Registry(RegistryError::Capacity(_)) => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, e.to_string()).into_response();
        }
    };

    // If the upgrade never completes the session is dropped, which removes the entry
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| run(socket, session, shutdown))
}

async fn run(socket: WebSocket, mut session: TunnelSession, shutdown: CancellationToken) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let Some(mut outbound) = session.take_outbound() else {
        log::error!("Tunnel {} has no outbound queue", session.token());
        return;
    };
    // Fires when a reconnect from the same peer takes the entry over
    let replaced = session.entry().close_signal();

    // Forward queued request frames to the node
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.next().await {
            if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Process frames from the node
    loop {
        let message = tokio::select! {
            message = ws_stream.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    log::warn!("Tunnel {} read error: {e}", session.token());
                    break;
                }
                None => break,
            },
            _ = &mut send_task => {
                log::warn!("Tunnel {} write side closed", session.token());
                break;
            }
            () = shutdown.cancelled() => {
                log::info!("Closing tunnel {}: relay shutting down", session.token());
                break;
            }
            () = replaced.cancelled() => {
                log::info!("Closing tunnel {}: entry removed", session.token());
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if let Err(e) = session.on_frame(text.as_str()) {
                    log::warn!("Dropping frame on tunnel {}: {e}", session.token());
                }
            }
            Message::Binary(_) => {
                log::warn!("Ignoring binary frame on tunnel {}", session.token());
            }
            Message::Close(_) => break,
            // Pings are answered by the websocket layer
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    send_task.abort();
    session.on_close();
}
