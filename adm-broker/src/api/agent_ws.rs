//! Agent streaming session endpoint. One connection per
//! agent; frames are JSON objects with a `type` discriminator, forwarded in
//! both directions over the connection's lifetime.
//!
//! A thin handler extracts state and upgrades the connection; a free
//! function then owns the socket for the rest of its lifetime.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::broker::RouterError;
use crate::model::{ClientId, DispatchResult, WorkspaceId};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentConnectQuery {
    pub workspace_id: WorkspaceId,
    pub client_id: Option<ClientId>,
    #[serde(default = "default_surface_type")]
    pub surface_type: SmolStr,
}

fn default_surface_type() -> SmolStr {
    SmolStr::new_static("gemini_cli")
}

pub async fn handler(
    State(state): State<AppState>,
    Query(query): Query<AgentConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: AgentConnectQuery) {
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);

    let (client_id, authenticated, challenge) = match state
        .broker
        .connect(query.workspace_id.clone(), query.client_id, query.surface_type, outbound_tx.clone())
        .await
    {
        Ok(result) => result,
        Err(error) => {
            warn!(%error, "broker unavailable, rejecting agent connection");
            return;
        }
    };

    let workspace_id = query.workspace_id;
    let mut authenticated = authenticated;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    if let Some(nonce) = challenge {
        let _ = outbound_tx.send(serde_json::json!({"type": "auth_challenge", "nonce": nonce})).await;
    }

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
            debug!(client_id = %client_id, "ignoring malformed frame");
            continue;
        };

        let msg_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or_default();

        if msg_type == "auth_response" {
            let token = frame.get("token").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
            let nonce_response = frame.get("nonce_response").and_then(|v| v.as_str()).unwrap_or_default().to_owned();

            match state.broker.verify_auth(workspace_id.clone(), client_id.clone(), token, nonce_response).await {
                Ok(crate::broker::AuthVerifyOutcome::Ok { flushed_tasks }) => {
                    authenticated = true;
                    let _ = outbound_tx
                        .send(serde_json::json!({"type": "auth_ok", "client_id": client_id, "flushed_tasks": flushed_tasks}))
                        .await;
                }
                Ok(crate::broker::AuthVerifyOutcome::Failed) => {
                    let _ = outbound_tx.send(serde_json::json!({"type": "auth_failed", "error": "Authentication failed"})).await;
                }
                Err(error) => {
                    warn!(%error, "broker unavailable during auth");
                    break;
                }
            }
            continue;
        }

        if !authenticated {
            let _ = outbound_tx.send(serde_json::json!({"type": "error", "error": "Not authenticated", "code": "AUTH_REQUIRED"})).await;
            continue;
        }

        match msg_type {
            "ack" => {
                let Some(task_id) = frame.get("execution_id").and_then(|v| v.as_str()) else { continue };
                match state.broker.ack(task_id.into(), client_id.clone()).await {
                    Ok(Ok(())) => state.broker.heartbeat(workspace_id.clone(), client_id.clone()).await,
                    Ok(Err(error)) => send_router_error(&outbound_tx, error).await,
                    Err(_) => {}
                }
            }
            "progress" => {
                let Some(task_id) = frame.get("execution_id").and_then(|v| v.as_str()) else { continue };
                match state.broker.progress_push(task_id.into(), client_id.clone()).await {
                    Ok(Ok(())) => state.broker.heartbeat(workspace_id.clone(), client_id.clone()).await,
                    Ok(Err(error)) => send_router_error(&outbound_tx, error).await,
                    Err(_) => {}
                }
            }
            "result" => {
                let Some(task_id) = frame.get("execution_id").and_then(|v| v.as_str()) else { continue };
                let result = dispatch_result_from_frame(task_id, &frame);

                match state.broker.result_push(task_id.into(), client_id.clone(), result).await {
                    Ok(Ok(())) => {
                        state.broker.heartbeat(workspace_id.clone(), client_id.clone()).await;
                        let _ = outbound_tx.send(serde_json::json!({"type": "result_ack", "execution_id": task_id})).await;
                    }
                    Ok(Err(error)) => send_router_error(&outbound_tx, error).await,
                    Err(error) => {
                        warn!(%error, "broker unavailable handling result");
                        break;
                    }
                }
            }
            "ping" => {
                state.broker.heartbeat(workspace_id.clone(), client_id.clone()).await;
                let ts = crate::model::now_wall_clock().unix_timestamp();
                let _ = outbound_tx.send(serde_json::json!({"type": "pong", "ts": ts})).await;
            }
            other => {
                debug!(client_id = %client_id, msg_type = other, "unknown agent frame type, ignored");
            }
        }
    }

    state.broker.disconnect(workspace_id, client_id).await;
    writer.abort();
}

async fn send_router_error(outbound_tx: &mpsc::Sender<serde_json::Value>, error: RouterError) {
    let message = match error {
        RouterError::Unknown => "Unknown execution",
        RouterError::NotOwner => "Not the assigned client",
    };
    let _ = outbound_tx.send(serde_json::json!({"type": "error", "error": message})).await;
}

fn dispatch_result_from_frame(task_id: &str, frame: &serde_json::Value) -> DispatchResult {
    DispatchResult {
        execution_id: task_id.into(),
        status: frame.get("status").and_then(|v| v.as_str()).unwrap_or("completed").into(),
        output: frame.get("output").and_then(|v| v.as_str()).map(ToOwned::to_owned),
        duration_seconds: frame.get("duration_seconds").and_then(serde_json::Value::as_f64),
        tool_calls: frame.get("tool_calls").and_then(|v| v.as_array()).cloned().unwrap_or_default(),
        files_modified: string_array(frame, "files_modified"),
        files_created: string_array(frame, "files_created"),
        error: frame.get("error").and_then(|v| v.as_str()).map(ToOwned::to_owned),
        governance: frame.get("governance").and_then(|v| v.as_object()).cloned().unwrap_or_default(),
        metadata: frame.get("metadata").and_then(|v| v.as_object()).cloned().unwrap_or_default(),
    }
}

fn string_array(frame: &serde_json::Value, key: &str) -> Vec<String> {
    frame
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(ToOwned::to_owned)).collect())
        .unwrap_or_default()
}
