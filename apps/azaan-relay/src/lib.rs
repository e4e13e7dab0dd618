//! Relay hub for live azaan broadcasts.
//!
//! One broadcaster per channel reaches many listeners either through relayed WebRTC negotiation
//! (`offer` / `answer` / `ice-candidate`) or, as a fallback, through audio chunks fanned out by
//! the hub itself. All channel state is in-memory and process-local.

pub mod config;
pub mod connections;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod telemetry;
pub mod topics;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;
use crate::connections::{ConnectionRegistry, DeliveryReport};
use crate::hub::{Envelope, Hub};

/// Shared state handed to every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct RelayState {
    pub hub: Hub,
    pub connections: ConnectionRegistry,
    pub config: Arc<RelayConfig>,
    pub metrics: Option<PrometheusHandle>,
    delivery: Arc<Mutex<()>>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: Hub::new(),
            connections: ConnectionRegistry::new(config.outbound_buffer),
            config: Arc::new(config),
            metrics: None,
            delivery: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Apply a hub transition and queue what it produced in one step.
    ///
    /// Queueing never blocks, so holding the delivery lock across both keeps every connection's
    /// notifications in the order the transitions were applied.
    pub fn dispatch<F>(&self, transition: F) -> DeliveryReport
    where
        F: FnOnce(&Hub) -> Vec<Envelope>,
    {
        let _ordered = self.delivery.lock();
        let envelopes = transition(&self.hub);
        self.connections.deliver(envelopes)
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health_check))
        .route("/active-broadcasts", get(handlers::active_broadcasts))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}
