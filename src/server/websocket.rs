//! WebSocket pub/sub endpoint
//!
//! `GET /ws/{feed}` upgrades to a websocket that joins the feed's topic.
//! Frames the socket sends are published to the other subscribers; messages
//! published by others are written back out, binary as binary and text as
//! text.

use super::AppState;
use crate::hub::{ClientSpec, Opcode};
use crate::topics::Topic;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, uri: Uri) -> Response {
    let topic = match Topic::from_path(uri.path(), "ws") {
        Ok(topic) => topic,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, topic))
}

async fn handle_socket(socket: WebSocket, state: AppState, topic: Topic) {
    let name = format!("ws-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let spec = ClientSpec::new(name.clone(), topic.clone()).capacity(state.config.client_outbox);

    let client = match state.hub.subscribe(spec).await {
        Ok(client) => client,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Could not subscribe websocket client");
            return;
        }
    };

    let conn_id = client.id();
    let publisher = client.publisher();
    let conn_done = state.shutdown.child_token();
    let (mut sender, mut receiver) = socket.split();

    info!(conn_id = %conn_id, topic = %topic, client = %name, "WebSocket client connected");

    // Spawn task to forward hub messages to the socket
    let send_done = conn_done.clone();
    let send_task = tokio::spawn(async move {
        let mut client = client;
        loop {
            let msg = tokio::select! {
                _ = send_done.cancelled() => break,
                msg = client.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let frame = match msg.opcode {
                Opcode::Binary => Message::Binary(msg.payload),
                Opcode::Text => Message::Text(String::from_utf8_lossy(&msg.payload).into_owned().into()),
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }

        let _ = sender.send(Message::Close(None)).await;
        send_done.cancel();
        client
    });

    // Process incoming messages
    loop {
        let frame = tokio::select! {
            _ = conn_done.cancelled() => break,
            frame = receiver.next() => frame,
        };

        let published = match frame {
            Some(Ok(Message::Binary(data))) => publisher.publish(Opcode::Binary, data).await,
            Some(Ok(Message::Text(text))) => {
                let data = Bytes::copy_from_slice(text.as_str().as_bytes());
                publisher.publish(Opcode::Text, data).await
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "WebSocket read error");
                break;
            }
        };

        if published.is_err() {
            break;
        }
    }

    conn_done.cancel();
    if let Ok(client) = send_task.await {
        let _ = client.unsubscribe().await;
    }

    debug!(conn_id = %conn_id, topic = %topic, "WebSocket client disconnected");
}
