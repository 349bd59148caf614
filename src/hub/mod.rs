//! Topic broker
//!
//! The hub owns the `topic -> subscribers` registry inside a single task.
//! Everything else talks to it over two mailboxes:
//!
//! - an unbounded control mailbox for register/unregister/queries, each
//!   acknowledged over a oneshot, and
//! - a bounded data mailbox for broadcasts.
//!
//! Control requests are always drained before the next broadcast, so once an
//! unregister has been acknowledged no further message is queued to that
//! client's outbox.

mod client;
pub mod stats;

pub use client::{Client, Publisher};
pub use stats::{ClientStats, StatsReport};

use crate::topics::Topic;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default capacity of a subscriber's outbox
pub const DEFAULT_CLIENT_CAPACITY: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
}

/// Unique identity of a client for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who a client is and which topic it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub topic: Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Binary,
    Text,
}

/// A published message
///
/// The payload is shared between every subscriber it is delivered to.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Arc<ClientInfo>,
    pub opcode: Opcode,
    pub payload: Bytes,
    pub sent: Instant,
}

/// What the hub does when a subscriber's outbox is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Drop the message for that subscriber only
    #[default]
    Drop,
    /// Evict the subscriber; its owner sees the outbox close
    Disconnect,
}

/// Parameters for a new subscription
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub name: String,
    pub topic: Topic,
    pub capacity: usize,
    pub policy: Backpressure,
}

impl ClientSpec {
    pub fn new(name: impl Into<String>, topic: Topic) -> Self {
        Self {
            name: name.into(),
            topic,
            capacity: DEFAULT_CLIENT_CAPACITY,
            policy: Backpressure::Drop,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn policy(mut self, policy: Backpressure) -> Self {
        self.policy = policy;
        self
    }
}

/// Report for one subscribed client
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub id: ClientId,
    pub name: String,
    pub topic: Topic,
    pub policy: Backpressure,
    pub stats: StatsReport,
}

struct Subscriber {
    info: Arc<ClientInfo>,
    outbox: mpsc::Sender<Message>,
    stats: Arc<ClientStats>,
    policy: Backpressure,
}

enum Control {
    Register {
        subscriber: Subscriber,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ClientId,
        topic: Topic,
        ack: Option<oneshot::Sender<()>>,
    },
    TopicCounts {
        reply: oneshot::Sender<BTreeMap<Topic, usize>>,
    },
    Reports {
        reply: oneshot::Sender<Vec<ClientReport>>,
    },
}

/// Handle to the hub task
#[derive(Clone)]
pub struct Hub {
    control: mpsc::UnboundedSender<Control>,
    data: mpsc::Sender<Message>,
}

impl Hub {
    /// Start the hub loop; it exits when `shutdown` is cancelled
    pub fn spawn(mailbox: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(mailbox.max(1));

        let task = HubTask {
            topics: HashMap::new(),
            control: control_rx,
            data: data_rx,
        };
        let join = tokio::spawn(task.run(shutdown));

        (
            Self {
                control: control_tx,
                data: data_tx,
            },
            join,
        )
    }

    /// Register a new client and return its owning handle
    ///
    /// The client is reachable by broadcasts once this returns.
    pub async fn subscribe(&self, spec: ClientSpec) -> Result<Client, HubError> {
        let info = Arc::new(ClientInfo {
            id: ClientId::new(),
            name: spec.name,
            topic: spec.topic,
        });
        let stats = Arc::new(ClientStats::new());
        let (outbox_tx, outbox_rx) = mpsc::channel(spec.capacity.max(1));

        let subscriber = Subscriber {
            info: info.clone(),
            outbox: outbox_tx,
            stats: stats.clone(),
            policy: spec.policy,
        };

        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Register { subscriber, ack })
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)?;

        let publisher = Publisher::new(info, stats, self.data.clone());
        Ok(Client::new(outbox_rx, publisher, self.control.clone()))
    }

    /// A publish-only identity on `topic`; it never receives messages
    pub fn publisher(&self, name: impl Into<String>, topic: Topic) -> Publisher {
        let info = Arc::new(ClientInfo {
            id: ClientId::new(),
            name: name.into(),
            topic,
        });
        Publisher::new(info, Arc::new(ClientStats::new()), self.data.clone())
    }

    /// Remove a client from its topic, waiting for the hub to confirm
    pub async fn unregister(&self, id: ClientId, topic: Topic) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Unregister {
                id,
                topic,
                ack: Some(ack),
            })
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Queue a message for fan-out to every subscriber of the sender's topic
    pub async fn broadcast(&self, msg: Message) -> Result<(), HubError> {
        self.data.send(msg).await.map_err(|_| HubError::Closed)
    }

    /// Number of subscribers per topic
    pub async fn topic_counts(&self) -> Result<BTreeMap<Topic, usize>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::TopicCounts { reply })
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Statistics for every subscribed client
    pub async fn reports(&self) -> Result<Vec<ClientReport>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Reports { reply })
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

struct HubTask {
    topics: HashMap<Topic, HashMap<ClientId, Subscriber>>,
    control: mpsc::UnboundedReceiver<Control>,
    data: mpsc::Receiver<Message>,
}

impl HubTask {
    async fn run(mut self, shutdown: CancellationToken) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                Some(control) = self.control.recv() => self.handle_control(control),
                Some(msg) = self.data.recv() => self.broadcast(msg),
                else => break,
            }
        }

        // Deliver what publishers already queued
        let mut drained = 0usize;
        while let Ok(msg) = self.data.try_recv() {
            self.broadcast(msg);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Queued messages delivered on shutdown");
        }

        let clients: usize = self.topics.values().map(HashMap::len).sum();
        info!(topics = self.topics.len(), clients, "Hub stopped");
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Register { subscriber, ack } => {
                self.register(subscriber);
                let _ = ack.send(());
            }
            Control::Unregister { id, topic, ack } => {
                self.unregister(id, &topic);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Control::TopicCounts { reply } => {
                let counts = self
                    .topics
                    .iter()
                    .map(|(topic, subs)| (topic.clone(), subs.len()))
                    .collect();
                let _ = reply.send(counts);
            }
            Control::Reports { reply } => {
                let mut reports: Vec<ClientReport> = self
                    .topics
                    .values()
                    .flat_map(HashMap::values)
                    .map(|sub| ClientReport {
                        id: sub.info.id,
                        name: sub.info.name.clone(),
                        topic: sub.info.topic.clone(),
                        policy: sub.policy,
                        stats: sub.stats.report(),
                    })
                    .collect();
                reports.sort_by(|a, b| (&a.topic, &a.name).cmp(&(&b.topic, &b.name)));
                let _ = reply.send(reports);
            }
        }
    }

    fn register(&mut self, subscriber: Subscriber) {
        let id = subscriber.info.id;
        let topic = subscriber.info.topic.clone();
        let subs = self.topics.entry(topic.clone()).or_default();

        if subs.contains_key(&id) {
            return;
        }

        debug!(topic = %topic, client = %subscriber.info.name, id = %id, "Client registered");
        subs.insert(id, subscriber);
    }

    fn unregister(&mut self, id: ClientId, topic: &Topic) {
        let Some(subs) = self.topics.get_mut(topic) else {
            return;
        };

        if let Some(sub) = subs.remove(&id) {
            debug!(topic = %topic, client = %sub.info.name, id = %id, "Client unregistered");
        }

        if subs.is_empty() {
            self.topics.remove(topic);
        }
    }

    fn broadcast(&mut self, msg: Message) {
        let topic = &msg.sender.topic;
        let Some(subs) = self.topics.get_mut(topic) else {
            trace!(topic = %topic, "No subscribers for topic");
            return;
        };

        let mut evicted = Vec::new();
        for (id, sub) in subs.iter() {
            if *id == msg.sender.id {
                continue;
            }

            match sub.outbox.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match sub.policy {
                    Backpressure::Drop => {
                        sub.stats.record_drop();
                        trace!(topic = %topic, client = %sub.info.name, "Outbox full, message dropped");
                    }
                    Backpressure::Disconnect => {
                        warn!(topic = %topic, client = %sub.info.name, "Outbox full, disconnecting client");
                        evicted.push(*id);
                    }
                },
                Err(TrySendError::Closed(_)) => {
                    debug!(topic = %topic, client = %sub.info.name, "Outbox closed, removing client");
                    evicted.push(*id);
                }
            }
        }

        for id in &evicted {
            subs.remove(id);
        }

        if subs.is_empty() {
            self.topics.remove(topic);
        }
    }
}
