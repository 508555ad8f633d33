//! WebSocket feed of task lifecycle events.
//!
//! Clients receive every [`refinery_core::TaskEvent`] as a JSON text
//! frame. Connections from outside the trusted networks are refused.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::AppState;

/// Parse a comma-separated list of CIDR strings.
pub fn parse_trusted_cidrs(s: &str) -> Result<Vec<IpNetwork>, String> {
    let mut nets = Vec::new();
    for raw in s.split(',') {
        let cidr = raw.trim();
        if cidr.is_empty() {
            continue;
        }
        let net: IpNetwork = cidr
            .parse()
            .map_err(|e| format!("invalid CIDR {cidr:?}: {e}"))?;
        nets.push(net);
    }
    Ok(nets)
}

fn is_trusted(nets: &[IpNetwork], addr: Option<SocketAddr>) -> bool {
    if nets.is_empty() {
        return true;
    }
    // No peer address means an in-process connection.
    let Some(addr) = addr else {
        return true;
    };
    nets.iter().any(|net| net.contains(addr.ip()))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !is_trusted(state.trusted_nets(), Some(addr)) {
        warn!(%addr, "refused untrusted websocket connection");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events().subscribe();

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!("websocket client connected");

    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("websocket send failed, client disconnected");
                            break;
                        }
                        WS_MESSAGES_SENT.inc();
                    }
                    Err(e) => warn!(%e, "failed to serialize event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "websocket client lagged");
                    WS_LAG_EVENTS.inc();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed");
                    break;
                }
            }
        }
    });

    // Drain the client side to notice closes and control frames.
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("websocket client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(%e, "websocket receive error");
                break;
            }
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!("websocket client disconnected");
}
