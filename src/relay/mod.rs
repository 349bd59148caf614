//! Rule engine
//!
//! Each rule becomes a relay: a hub client subscribed to the rule's stream,
//! a reconnecting websocket dialing the rule's destination, and two tasks
//! moving messages between them. The engine owns every relay inside its own
//! task; callers send it commands and wait for the reply.
//!
//! Applying a rule whose id is already installed tears the old relay down,
//! including its hub subscription, before the new one subscribes. Two relays
//! for the same id are never subscribed at the same time.

pub mod rule;

pub use rule::{Rule, RuleError, DELETE_ALL};

use crate::hub::{Client, ClientId, ClientSpec, ClientStats, Hub, HubError, Opcode, Publisher, StatsReport};
use reconws::{ConnectionState, Metrics, MessageKind, ReconWs, ReconWsConfig, ReconWsHandle, RetryConfig, WsMessage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl From<HubError> for RuleError {
    fn from(_: HubError) -> Self {
        RuleError::EngineStopped
    }
}

/// Settings shared by every relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Capacity of each relay's hub outbox
    pub outbox: usize,

    /// Reconnect timing for the outbound websocket
    pub retry: RetryConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbox: 2,
            retry: RetryConfig::default(),
        }
    }
}

/// Live status of one relay
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub rule: Rule,
    pub client: ClientId,
    pub state: ConnectionState,
    pub websocket: Metrics,
    pub stats: StatsReport,
}

enum Command {
    Apply {
        rule: Rule,
        reply: oneshot::Sender<Result<(), RuleError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<usize>,
    },
    RemoveAll {
        reply: oneshot::Sender<usize>,
    },
    List {
        reply: oneshot::Sender<Vec<Rule>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<Rule>>,
    },
    Reports {
        reply: oneshot::Sender<Vec<RelayReport>>,
    },
}

/// Handle to the rule engine task
#[derive(Clone)]
pub struct RuleEngine {
    commands: mpsc::Sender<Command>,
}

impl RuleEngine {
    /// Start the engine; cancelling `shutdown` stops every relay
    pub fn spawn(hub: Hub, settings: RelaySettings, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);

        let task = EngineTask {
            hub,
            settings,
            relays: BTreeMap::new(),
            commands: rx,
            shutdown: shutdown.clone(),
        };
        let join = tokio::spawn(task.run());

        (Self { commands: tx }, join)
    }

    /// Install a rule, replacing any rule with the same id
    ///
    /// Returns as soon as the relay is wired up; the websocket connects (and
    /// retries) in the background.
    pub async fn apply(&self, rule: Rule) -> Result<(), RuleError> {
        let rule = rule.validated()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Apply { rule, reply }).await?;
        rx.await.map_err(|_| RuleError::EngineStopped)?
    }

    /// Remove one rule; `deleteAll` removes every rule
    ///
    /// Returns how many rules were removed.
    pub async fn remove(&self, id: &str) -> Result<usize, RuleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    pub async fn remove_all(&self) -> Result<usize, RuleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveAll { reply }).await?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    /// Every installed rule, ordered by id
    pub async fn rules(&self) -> Result<Vec<Rule>, RuleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    pub async fn rule(&self, id: &str) -> Result<Option<Rule>, RuleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    pub async fn reports(&self) -> Result<Vec<RelayReport>, RuleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reports { reply }).await?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    async fn send(&self, command: Command) -> Result<(), RuleError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RuleError::EngineStopped)
    }
}

struct RelayClient {
    rule: Rule,
    client: ClientId,
    stats: Arc<ClientStats>,
    websocket: ReconWsHandle,
    cancel: CancellationToken,
    relay_out: JoinHandle<()>,
    relay_in: JoinHandle<()>,
}

impl RelayClient {
    /// Stop both relay tasks and wait until the hub has dropped the client
    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.relay_out.await;
        let _ = self.relay_in.await;
        debug!(rule = %self.rule.id, "Relay stopped");
    }

    fn report(&self) -> RelayReport {
        RelayReport {
            rule: self.rule.clone(),
            client: self.client,
            state: self.websocket.state(),
            websocket: self.websocket.metrics(),
            stats: self.stats.report(),
        }
    }
}

struct EngineTask {
    hub: Hub,
    settings: RelaySettings,
    relays: BTreeMap<String, RelayClient>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl EngineTask {
    async fn run(mut self) {
        info!("Rule engine started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle(command).await,
                else => break,
            }
        }

        let removed = self.remove_all().await;
        info!(removed, "Rule engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Apply { rule, reply } => {
                let _ = reply.send(self.apply(rule).await);
            }
            Command::Remove { id, reply } => {
                let removed = if id == DELETE_ALL {
                    self.remove_all().await
                } else {
                    self.remove(&id).await
                };
                let _ = reply.send(removed);
            }
            Command::RemoveAll { reply } => {
                let _ = reply.send(self.remove_all().await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.relays.values().map(|r| r.rule.clone()).collect());
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.relays.get(&id).map(|r| r.rule.clone()));
            }
            Command::Reports { reply } => {
                let _ = reply.send(self.relays.values().map(RelayClient::report).collect());
            }
        }
    }

    async fn apply(&mut self, rule: Rule) -> Result<(), RuleError> {
        if let Some(old) = self.relays.remove(&rule.id) {
            info!(rule = %rule.id, "Replacing existing rule");
            old.shutdown().await;
        }

        let spec = ClientSpec::new(rule.destination.clone(), rule.stream.clone())
            .capacity(self.settings.outbox);
        let client = self.hub.subscribe(spec).await?;

        let cancel = self.shutdown.child_token();
        let mut config = ReconWsConfig::new(rule.destination.clone()).retry(self.settings.retry.clone());
        if let Some(token) = &rule.token {
            config = config.token(token.clone());
        }
        let (out, inbound, websocket) = ReconWs::spawn_with_cancel(config, cancel.child_token()).into_parts();

        let client_id = client.id();
        let stats = client.stats().clone();
        let publisher = client.publisher();

        let relay_out = tokio::spawn(relay_out(client, out, cancel.clone()));
        let relay_in = tokio::spawn(relay_in(inbound, publisher, cancel.clone()));

        info!(
            rule = %rule.id,
            stream = %rule.stream,
            destination = %rule.destination,
            "Rule applied"
        );

        self.relays.insert(
            rule.id.clone(),
            RelayClient {
                rule,
                client: client_id,
                stats,
                websocket,
                cancel,
                relay_out,
                relay_in,
            },
        );

        Ok(())
    }

    async fn remove(&mut self, id: &str) -> usize {
        match self.relays.remove(id) {
            Some(relay) => {
                relay.shutdown().await;
                info!(rule = %id, "Rule removed");
                1
            }
            None => {
                debug!(rule = %id, "No rule to remove");
                0
            }
        }
    }

    async fn remove_all(&mut self) -> usize {
        let relays = std::mem::take(&mut self.relays);
        let count = relays.len();

        for relay in relays.into_values() {
            relay.shutdown().await;
        }

        if count > 0 {
            info!(count, "All rules removed");
        }
        count
    }
}

/// Hub outbox to websocket
async fn relay_out(mut client: Client, out: mpsc::Sender<WsMessage>, cancel: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            msg = client.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let msg = match msg.opcode {
            Opcode::Binary => WsMessage::binary(msg.payload),
            Opcode::Text => WsMessage::text(msg.payload),
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            sent = out.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    let name = client.name().to_string();
    if let Err(e) = client.unsubscribe().await {
        debug!(client = %name, error = %e, "Unsubscribe after relay stop failed");
    }
}

/// Websocket to hub, published as the relay's own client
async fn relay_in(mut inbound: mpsc::Receiver<WsMessage>, publisher: Publisher, cancel: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let opcode = match msg.kind {
            MessageKind::Binary => Opcode::Binary,
            MessageKind::Text => Opcode::Text,
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            published = publisher.publish(opcode, msg.data) => {
                if published.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::Topic;
    use std::time::Duration;

    fn settings() -> RelaySettings {
        RelaySettings {
            outbox: 2,
            retry: RetryConfig::default().bounds(Duration::from_millis(10), Duration::from_millis(50)),
        }
    }

    fn rule(id: &str, stream: &str) -> Rule {
        // Nothing listens on port 1; relays just keep retrying
        Rule::new(id, Topic::parse(stream).unwrap(), format!("ws://127.0.0.1:1/{}", id))
    }

    fn start() -> (Hub, RuleEngine, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (hub, _) = Hub::spawn(10, shutdown.clone());
        let (engine, _) = RuleEngine::spawn(hub.clone(), settings(), shutdown.clone());
        (hub, engine, shutdown)
    }

    #[tokio::test]
    async fn test_apply_subscribes_to_stream() {
        let (hub, engine, shutdown) = start();

        engine.apply(rule("r1", "video0")).await.unwrap();

        let counts = hub.topic_counts().await.unwrap();
        assert_eq!(counts.get(&Topic::parse("video0").unwrap()), Some(&1));
        assert_eq!(engine.rules().await.unwrap().len(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_apply_same_id_replaces() {
        let (hub, engine, shutdown) = start();

        engine.apply(rule("r1", "video0")).await.unwrap();
        engine.apply(rule("r1", "audio")).await.unwrap();

        let counts = hub.topic_counts().await.unwrap();
        assert_eq!(counts.get(&Topic::parse("video0").unwrap()), None);
        assert_eq!(counts.get(&Topic::parse("audio").unwrap()), Some(&1));

        let current = engine.rule("r1").await.unwrap().unwrap();
        assert_eq!(current.stream.as_str(), "audio");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_remove_and_remove_all() {
        let (hub, engine, shutdown) = start();

        for id in ["a", "b", "c"] {
            engine.apply(rule(id, "video0")).await.unwrap();
        }

        assert_eq!(engine.remove("a").await.unwrap(), 1);
        assert_eq!(engine.remove("a").await.unwrap(), 0);
        assert_eq!(engine.rules().await.unwrap().len(), 2);

        assert_eq!(engine.remove(DELETE_ALL).await.unwrap(), 2);
        assert!(engine.rules().await.unwrap().is_empty());
        assert!(hub.topic_counts().await.unwrap().is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_rule() {
        let (_hub, engine, shutdown) = start();

        let reserved = rule(DELETE_ALL, "video0");
        assert!(matches!(engine.apply(reserved).await, Err(RuleError::ReservedId(_))));

        let bad = Rule::new("x", Topic::parse("video0").unwrap(), "http://example.com");
        assert!(matches!(engine.apply(bad).await, Err(RuleError::InvalidDestination(_))));

        assert!(engine.rules().await.unwrap().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reports_show_websocket_state() {
        let (_hub, engine, shutdown) = start();

        engine.apply(rule("r1", "video0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reports = engine.reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].rule.id, "r1");
        assert_ne!(reports[0].state, ConnectionState::Connected);
        assert!(reports[0].websocket.dial_failures >= 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_engine_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let (hub, _) = Hub::spawn(10, shutdown.clone());
        let (engine, join) = RuleEngine::spawn(hub, settings(), shutdown.clone());

        engine.apply(rule("r1", "video0")).await.unwrap();
        shutdown.cancel();
        join.await.unwrap();

        assert_eq!(engine.rules().await, Err(RuleError::EngineStopped));
    }
}
