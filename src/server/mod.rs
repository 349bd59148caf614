//! Relay hub HTTP server
//!
//! Hosts transport stream ingest, the websocket pub/sub endpoint, the REST
//! admin API and health check on one axum router. [`RelayServer`] owns the
//! hub, the rule and stream engines and the admin listener. When the
//! shutdown token fires the HTTP side drains first; the hub and engines keep
//! running until it has, so frames buffered by in-flight ingests still get
//! published.

pub mod admin;
pub mod api;
pub mod ingest;
pub mod websocket;

use crate::aggregate::StreamEngine;
use crate::config::Config;
use crate::hub::Hub;
use crate::relay::{Rule, RuleEngine};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub rules: RuleEngine,
    pub streams: StreamEngine,
    pub config: Arc<Config>,
    /// Fires when the server starts shutting down; handlers watch it
    pub shutdown: CancellationToken,
}

/// Create the axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ts/{*feed}", post(ingest::ingest_handler).put(ingest::ingest_handler))
        .route("/ws/{*feed}", get(websocket::ws_handler))
        .route("/api/destinations", post(api::add_destination))
        .route(
            "/api/destinations/all",
            get(api::list_destinations).delete(api::delete_all_destinations),
        )
        .route(
            "/api/destinations/{id}",
            get(api::show_destination).delete(api::delete_destination),
        )
        .route("/api/streams", post(api::add_stream))
        .route("/api/streams/all", get(api::list_streams).delete(api::delete_all_streams))
        .route("/api/streams/{stream}", get(api::show_stream).delete(api::delete_stream))
        .route("/api/stats", get(api::stats))
        .route("/health", get(api::health))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// The hub, engines and admin listener, ready to serve HTTP
pub struct RelayServer {
    state: AppState,
    /// Stops the hub, the engines and the admin listener
    core: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayServer {
    /// Spawn the hub, the rule and stream engines and (if configured) the
    /// admin listener
    ///
    /// They stop once [`run`](Self::run) has drained HTTP after `shutdown`
    /// fires, or when the server is dropped without running.
    pub async fn start(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let core = CancellationToken::new();

        let (hub, hub_task) = Hub::spawn(config.hub_mailbox, core.clone());
        let (rules, engine_task) = RuleEngine::spawn(hub.clone(), config.relay.clone(), core.clone());
        let (streams, streams_task) = StreamEngine::spawn(hub.clone(), config.client_outbox, core.clone());
        let mut tasks = vec![engine_task, streams_task, hub_task];

        if let Some(topic) = config.admin_topic.clone() {
            let engines = admin::Engines {
                rules: rules.clone(),
                streams: streams.clone(),
            };
            let admin = match admin::spawn_admin_listener(&hub, engines, topic, core.clone()).await {
                Ok(admin) => admin,
                Err(e) => {
                    core.cancel();
                    return Err(e).context("Failed to start admin listener");
                }
            };
            tasks.insert(0, admin);
        }

        let state = AppState {
            hub,
            rules,
            streams,
            config: Arc::new(config),
            shutdown,
        };

        Ok(Self { state, core, tasks })
    }

    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.state.rules
    }

    pub fn streams(&self) -> &StreamEngine {
        &self.state.streams
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Install rules, e.g. from a startup file
    pub async fn apply_rules(&self, rules: Vec<Rule>) -> Result<usize> {
        let count = rules.len();
        for rule in rules {
            let id = rule.id.clone();
            self.state
                .rules
                .apply(rule)
                .await
                .with_context(|| format!("Failed to apply rule '{}'", id))?;
        }
        Ok(count)
    }

    /// Bind and serve until the shutdown token is cancelled
    pub async fn serve(self) -> Result<()> {
        let bind = self.state.config.bind;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        self.run(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// Once shutdown starts, in-flight requests get `http_wait` to finish
    /// before the server task is aborted. Only then are the hub and engines
    /// stopped.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(addr = %addr, "Relay hub listening");

        let app = create_router(self.state.clone());
        let graceful = self.state.shutdown.clone().cancelled_owned();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(graceful).await
        });

        let finished = tokio::select! {
            result = &mut server => Some(result),
            _ = self.state.shutdown.cancelled() => None,
        };

        let result = match finished {
            Some(result) => result,
            None => match tokio::time::timeout(self.state.config.http_wait, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(wait = ?self.state.config.http_wait, "HTTP handlers still running, aborting");
                    server.abort();
                    Ok(Ok(()))
                }
            },
        };

        // The server may have failed on its own; stop everything else too
        self.state.shutdown.cancel();
        self.core.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }

        info!("Relay hub stopped");
        result.context("HTTP server task failed")?.context("HTTP server error")?;
        Ok(())
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.core.cancel();
    }
}
