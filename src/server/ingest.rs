//! HTTP transport stream ingest
//!
//! `POST /ts/{feed}` (or `PUT`) streams raw MPEG-TS in the request body. The
//! body is framed and each frame is published as a binary message on the
//! feed's topic for as long as the request stays open. On shutdown the body
//! is cut off and whatever whole packets were buffered are published before
//! the handler returns.

use super::AppState;
use crate::framer;
use crate::hub::Opcode;
use crate::topics::Topic;

use axum::{
    body::Body,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

pub async fn ingest_handler(State(state): State<AppState>, uri: Uri, body: Body) -> Response {
    let topic = match Topic::from_path(uri.path(), "ts") {
        Ok(topic) => topic,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let name = format!("ts-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let publisher = state.hub.publisher(name.clone(), topic.clone());
    info!(topic = %topic, client = %name, "Ingest started");

    let body = body
        .into_data_stream()
        .take_until(state.shutdown.clone().cancelled_owned());
    let frames = framer::frames(body, state.config.framer.clone());
    tokio::pin!(frames);

    let mut count = 0u64;
    let mut bytes = 0u64;
    while let Some(frame) = frames.next().await {
        let len = frame.len() as u64;
        if publisher.publish(Opcode::Binary, frame).await.is_err() {
            debug!(topic = %topic, client = %name, "Hub gone, ingest stopped");
            break;
        }
        count += 1;
        bytes += len;
    }

    info!(topic = %topic, client = %name, frames = count, bytes, "Ingest finished");
    StatusCode::NO_CONTENT.into_response()
}
