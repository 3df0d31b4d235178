use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::error::ApiError;
use super::{AppState, MAX_REALTIME_CONNECTIONS};
use crate::shutdown::ConnectionGuard;

const READ_BUF: usize = 32 * 1024;
/// A viewer that stops reading cannot hold up shutdown past this.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    session_id: String,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        session_id: state.session_id,
    })
}

/// Upgrade to a websocket bridged to a fresh tunnel connection. The
/// connection slot is reserved and the tunnel dialed before the upgrade, so
/// the cap holds under concurrent upgrades and a dead tunnel is a 503, not
/// a socket that closes immediately.
pub(super) async fn ws_desktop(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    let slot = state
        .shutdown
        .try_register(MAX_REALTIME_CONNECTIONS)
        .ok_or(ApiError::TooManyConnections)?;
    let tunnel = TcpStream::connect(state.tunnel_addr)
        .await
        .map_err(|e| ApiError::TunnelUnavailable(e.to_string()))?;
    let _ = tunnel.set_nodelay(true);
    Ok(ws.on_upgrade(move |socket| relay(socket, tunnel, state, slot)))
}

async fn relay(
    socket: WebSocket,
    tunnel: TcpStream,
    state: AppState,
    (_guard, mut shutdown_rx): (ConnectionGuard, watch::Receiver<bool>),
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut tunnel_rx, mut tunnel_tx) = tunnel.into_split();
    let mut buf = vec![0u8; READ_BUF];

    tracing::debug!(session_id = %state.session_id, "realtime connection opened");

    if *shutdown_rx.borrow_and_update() {
        let _ = tokio::time::timeout(
            CLOSE_SEND_TIMEOUT,
            ws_tx.send(close_message("worker shutting down")),
        )
        .await;
        return;
    }

    loop {
        tokio::select! {
            // Display -> browser
            read = tunnel_rx.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        let _ = ws_tx.send(close_message("display stream closed")).await;
                        break;
                    }
                    Ok(n) => {
                        let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                        if ws_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // Browser -> display
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if tunnel_tx.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if tunnel_tx.write_all(text.as_str().as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!("realtime connection received shutdown signal, closing");
                    let _ = tokio::time::timeout(CLOSE_SEND_TIMEOUT, async {
                        ws_tx.send(close_message("worker shutting down")).await?;
                        ws_tx.flush().await
                    })
                    .await;
                    break;
                }
            }
        }
    }

    let _ = tunnel_tx.shutdown().await;
    tracing::debug!(session_id = %state.session_id, "realtime connection closed");
    // _guard is dropped here, decrementing the active connection count
}

fn close_message(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    }))
}
