//! WebSocket terminal channel.
//!
//! Frames are JSON text messages tagged by `type`. Browsers cannot set an
//! `Authorization` header on a WebSocket handshake, so the bearer token may
//! also arrive as a `token` query parameter. Authorization failures are
//! reported as an `error` frame followed by a close.

use crate::{auth::bearer_token, state::AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use vm_ssh::{ClientEvent, ServerEvent};

/// Frames buffered in each direction
const CHANNEL_CAPACITY: usize = 64;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/v1/workspaces/{ws}/instances/{id}/terminal",
        get(terminal_handler),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
}

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((workspace_id, instance_id)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = bearer_token(&headers).map(str::to_string).or(query.token);

    ws.on_upgrade(move |socket| handle_socket(socket, state, token, workspace_id, instance_id))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    token: Option<String>,
    workspace_id: String,
    instance_id: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let request = match state
        .terminal
        .handshake(token.as_deref(), Some(&workspace_id), Some(&instance_id))
        .await
    {
        Ok(request) => request,
        Err(e) => {
            warn!(%workspace_id, %instance_id, "Terminal handshake rejected: {}", e);
            let event = ServerEvent::Error {
                message: e.to_string(),
            };
            let _ = send_event(&mut sender, &event).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let (client_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (server_tx, mut server_rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(event) = server_rx.recv().await {
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            if let Some(event) = parse_client_frame(&msg) {
                if client_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });

    // Returns once either side is gone; the session is torn down by then
    state
        .terminal
        .run(&connection_id, &request, client_rx, server_tx)
        .await;

    recv_task.abort();
    let _ = send_task.await;
    debug!(%connection_id, "Terminal socket closed");
}

/// Decode a client frame. Control frames and malformed payloads yield `None`.
pub fn parse_client_frame(msg: &Message) -> Option<ClientEvent> {
    let parsed: serde_json::Result<ClientEvent> = match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()),
        Message::Binary(bytes) => serde_json::from_slice(bytes),
        _ => return None,
    };

    match parsed {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring malformed terminal frame: {}", e);
            None
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_and_resize_frames() {
        let input = Message::Text(r#"{"type":"input","data":"ls\n"}"#.into());
        assert_eq!(
            parse_client_frame(&input),
            Some(ClientEvent::Input {
                data: "ls\n".to_string()
            })
        );

        let resize = Message::Text(r#"{"type":"resize","cols":120,"rows":40}"#.into());
        assert_eq!(
            parse_client_frame(&resize),
            Some(ClientEvent::Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn test_ignores_malformed_and_control_frames() {
        assert_eq!(parse_client_frame(&Message::Text("not json".into())), None);
        assert_eq!(
            parse_client_frame(&Message::Text(r#"{"type":"reboot"}"#.into())),
            None
        );
        assert_eq!(parse_client_frame(&Message::Ping(Vec::new().into())), None);
    }

    #[test]
    fn test_server_frames_are_tagged() {
        let json = serde_json::to_value(ServerEvent::Output {
            data: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "output", "data": "hi"}));

        let json = serde_json::to_value(ServerEvent::Connected).unwrap();
        assert_eq!(json, serde_json::json!({"type": "connected"}));
    }
}
