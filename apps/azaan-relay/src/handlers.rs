use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::connections::ConnectionSnapshot;
use crate::hub::ChannelSnapshot;
use crate::RelayState;

#[derive(Debug, Serialize)]
pub struct ActiveBroadcastsResponse {
    pub broadcasts: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub active_channels: usize,
    pub channels: Vec<ChannelSnapshot>,
    pub connections: Vec<ConnectionSnapshot>,
}

pub async fn index() -> &'static str {
    "Azaan relay is running!"
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ids of every live channel.
pub async fn active_broadcasts(State(state): State<RelayState>) -> Json<ActiveBroadcastsResponse> {
    let broadcasts = state.hub.active_channels();
    Json(ActiveBroadcastsResponse {
        count: broadcasts.len(),
        broadcasts,
    })
}

pub async fn stats(State(state): State<RelayState>) -> Json<StatsResponse> {
    let channels = state.hub.snapshot();
    let connections = state.connections.snapshot();
    Json(StatsResponse {
        active_connections: connections.len(),
        active_channels: channels.len(),
        channels,
        connections,
    })
}

pub async fn metrics(State(state): State<RelayState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
