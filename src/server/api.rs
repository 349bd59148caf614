//! REST admin API
//!
//! - `POST /api/destinations` installs a rule (JSON body)
//! - `GET /api/destinations/all` lists rules keyed by id
//! - `GET /api/destinations/{id}` shows one rule
//! - `DELETE /api/destinations/{id}` removes one rule
//! - `DELETE /api/destinations/all` (or `/deleteAll`) removes every rule
//! - `POST /api/streams` installs a stream rule `{"stream","feeds"}`
//! - `GET /api/streams/all` lists stream rules keyed by stream
//! - `GET|DELETE /api/streams/{stream}` shows or removes one stream; nested
//!   stream names are percent-encoded (`stream%2Ffront`)
//! - `DELETE /api/streams/all` removes every stream
//! - `GET /api/stats` reports topics, clients, relays and streams

use super::AppState;
use crate::aggregate::{StreamError, StreamRule};
use crate::relay::{Rule, RuleError, DELETE_ALL};
use crate::topics::Topic;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::warn;

fn rule_error(e: RuleError) -> Response {
    let status = match e {
        RuleError::NotFound(_) => StatusCode::NOT_FOUND,
        RuleError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

fn stream_error(e: StreamError) -> Response {
    let status = match e {
        StreamError::NotFound(_) => StatusCode::NOT_FOUND,
        StreamError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

pub async fn add_destination(State(state): State<AppState>, Json(rule): Json<Rule>) -> Response {
    let rule = match rule.validated() {
        Ok(rule) => rule,
        Err(e) => return rule_error(e),
    };

    match state.rules.apply(rule.clone()).await {
        Ok(()) => Json(rule).into_response(),
        Err(e) => {
            warn!(rule = %rule.id, error = %e, "Apply failed");
            rule_error(e)
        }
    }
}

pub async fn list_destinations(State(state): State<AppState>) -> Response {
    match state.rules.rules().await {
        Ok(rules) => {
            let by_id: BTreeMap<String, Rule> =
                rules.into_iter().map(|rule| (rule.id.clone(), rule)).collect();
            Json(by_id).into_response()
        }
        Err(e) => rule_error(e),
    }
}

pub async fn show_destination(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.rules.rule(&id).await {
        Ok(Some(rule)) => Json(rule).into_response(),
        Ok(None) => rule_error(RuleError::NotFound(id)),
        Err(e) => rule_error(e),
    }
}

pub async fn delete_destination(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if id == DELETE_ALL {
        return delete_all_destinations(State(state)).await;
    }

    match state.rules.remove(&id).await {
        Ok(0) => rule_error(RuleError::NotFound(id)),
        Ok(_) => Json(id).into_response(),
        Err(e) => rule_error(e),
    }
}

pub async fn delete_all_destinations(State(state): State<AppState>) -> Response {
    match state.rules.remove_all().await {
        Ok(_) => Json(DELETE_ALL).into_response(),
        Err(e) => rule_error(e),
    }
}

pub async fn add_stream(State(state): State<AppState>, Json(rule): Json<StreamRule>) -> Response {
    let rule = match rule.validated() {
        Ok(rule) => rule,
        Err(e) => return stream_error(e),
    };

    match state.streams.apply(rule.clone()).await {
        Ok(()) => Json(rule).into_response(),
        Err(e) => {
            warn!(stream = %rule.stream, error = %e, "Stream apply failed");
            stream_error(e)
        }
    }
}

pub async fn list_streams(State(state): State<AppState>) -> Response {
    match state.streams.streams().await {
        Ok(streams) => {
            let by_stream: BTreeMap<Topic, Vec<Topic>> =
                streams.into_iter().map(|rule| (rule.stream, rule.feeds)).collect();
            Json(by_stream).into_response()
        }
        Err(e) => stream_error(e),
    }
}

pub async fn show_stream(State(state): State<AppState>, Path(stream): Path<String>) -> Response {
    match state.streams.stream(&stream).await {
        Ok(Some(rule)) => Json(rule).into_response(),
        Ok(None) => stream_error(StreamError::NotFound(stream)),
        Err(e) => stream_error(e),
    }
}

pub async fn delete_stream(State(state): State<AppState>, Path(stream): Path<String>) -> Response {
    if stream == DELETE_ALL {
        return delete_all_streams(State(state)).await;
    }

    match state.streams.remove(&stream).await {
        Ok(0) => stream_error(StreamError::NotFound(stream)),
        Ok(_) => Json(stream).into_response(),
        Err(e) => stream_error(e),
    }
}

pub async fn delete_all_streams(State(state): State<AppState>) -> Response {
    match state.streams.remove_all().await {
        Ok(_) => Json(DELETE_ALL).into_response(),
        Err(e) => stream_error(e),
    }
}

pub async fn stats(State(state): State<AppState>) -> Response {
    let topics = match state.hub.topic_counts().await {
        Ok(topics) => topics,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let clients = match state.hub.reports().await {
        Ok(clients) => clients,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let relays = match state.rules.reports().await {
        Ok(relays) => relays,
        Err(e) => return rule_error(e),
    };
    let streams = match state.streams.streams().await {
        Ok(streams) => streams,
        Err(e) => return stream_error(e),
    };

    Json(json!({
        "topics": topics,
        "clients": clients,
        "relays": relays,
        "streams": streams,
    }))
    .into_response()
}

pub async fn health() -> &'static str {
    "ok"
}
