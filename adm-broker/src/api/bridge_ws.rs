//! Bridge control channel endpoint. The orchestration
//! backend's bridge connects here and receives `assign`/`unassign`
//! broadcasts whenever a workspace is handed to, or taken away from, it.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct BridgeConnectQuery {
    pub bridge_id: SmolStr,
    pub owner_user_id: Option<SmolStr>,
}

pub async fn handler(
    State(state): State<AppState>,
    Query(query): Query<BridgeConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: BridgeConnectQuery) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);

    state.broker.register_bridge(query.bridge_id.clone(), query.owner_user_id, outbound_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // The bridge sends no frames of its own; we only read to detect when the
    // socket closes (ping/close frames are handled by axum's ws machinery).
    while let Some(Ok(_)) = stream.next().await {}

    state.broker.unregister_bridge(query.bridge_id).await;
    writer.abort();
}
