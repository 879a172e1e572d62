//! WebSocket handler for export clients
//!
//! Clients connect to `/` with the `security-phrase` header. A refused
//! client gets `error:<reason>` followed by a close frame; clients already
//! attached are not affected.

use crate::clients::ClientSlot;
use crate::stream::Command;
use crate::{AppState, RejectReason, ServerEvent, PROTOCOL_VERSION, SECRET_HEADER};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

/// True when the request carries the shared secret
pub fn has_credential(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|phrase| phrase == state.config.secret)
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let admission = if has_credential(&state, &headers) {
        ClientSlot::claim(&state, addr)
    } else {
        Err(RejectReason::Credential)
    };

    if let Err(reason) = &admission {
        tracing::warn!(%addr, %reason, "Export connection refused");
        if *reason == RejectReason::Capacity {
            state.notify(ServerEvent::Error(reason.to_string()));
        }
    }

    ws.on_upgrade(move |socket| async move {
        match admission {
            Ok(slot) => handle_client(socket, state, slot).await,
            Err(reason) => reject(socket, reason).await,
        }
    })
}

async fn reject(mut socket: WebSocket, reason: RejectReason) {
    let _ = socket
        .send(Message::Text(format!("error:{}", reason).into()))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "rejected".into(),
        })))
        .await;
}

/// Handle an admitted client until it leaves or the server stops
async fn handle_client(socket: WebSocket, state: AppState, slot: ClientSlot) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut rx = state.ws_tx.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();
    let mut shutdown = state.shutdown.clone();
    let name = slot.name().to_string();

    // Broadcast frames plus replies addressed to this client only
    let send_name = name.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(text) => text,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(client = %send_name, skipped, "Export client lagging");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(text) = direct_rx.recv() => text,
                _ = shutdown.changed() => {
                    let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server stopped".into(),
                    }))).await;
                    break;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_name = name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_message(&recv_state, &recv_name, text.as_str(), &direct_tx)
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    drop(slot);
    tracing::debug!(client = %name, "WebSocket client disconnected");
}

fn handle_message(state: &AppState, client: &str, text: &str, reply: &mpsc::UnboundedSender<String>) {
    tracing::debug!(client, message = text, "Export client message");
    state.notify(ServerEvent::ClientMessage {
        client: client.to_string(),
        message: text.to_string(),
    });

    match Command::parse(text) {
        Some(Command::GetProtocolVersion) => {
            let _ = reply.send(format!("protocol-version:{}", PROTOCOL_VERSION));
        }
        Some(Command::Start) => {
            if let Err(e) = state.start_stream() {
                let _ = reply.send(format!("error:{}", e));
            }
        }
        Some(Command::Pause) => state.pause_stream(),
        Some(Command::Stop) => state.stop_stream(),
        None => {}
    }
}
