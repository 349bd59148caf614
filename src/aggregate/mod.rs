//! Stream aggregation
//!
//! A stream rule merges several feeds into one stream: the engine subscribes
//! a hub client to each feed and republishes whatever arrives onto the
//! stream's topic. Subscribers of the stream see the feeds interleaved in
//! arrival order.
//!
//! Like the relay engine, every aggregator lives inside the engine task.
//! Replacing a stream tears the old aggregator down, unsubscribes included,
//! before the new one subscribes. Rules that would route a stream back into
//! one of its own feeds are refused.

pub mod rule;

pub use rule::{StreamError, StreamRule};

use crate::hub::{Client, ClientSpec, Hub, HubError, Publisher};
use crate::relay::DELETE_ALL;
use crate::topics::Topic;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl From<HubError> for StreamError {
    fn from(_: HubError) -> Self {
        StreamError::EngineStopped
    }
}

enum Command {
    Apply {
        rule: StreamRule,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Remove {
        stream: Topic,
        reply: oneshot::Sender<usize>,
    },
    RemoveAll {
        reply: oneshot::Sender<usize>,
    },
    List {
        reply: oneshot::Sender<Vec<StreamRule>>,
    },
}

/// Handle to the stream engine task
#[derive(Clone)]
pub struct StreamEngine {
    commands: mpsc::Sender<Command>,
}

impl StreamEngine {
    /// Start the engine; `outbox` is the capacity of each feed subscription
    pub fn spawn(hub: Hub, outbox: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);

        let task = EngineTask {
            hub,
            outbox,
            streams: BTreeMap::new(),
            commands: rx,
            shutdown,
        };
        let join = tokio::spawn(task.run());

        (Self { commands: tx }, join)
    }

    /// Install a stream rule, replacing any rule for the same stream
    pub async fn apply(&self, rule: StreamRule) -> Result<(), StreamError> {
        let rule = rule.validated()?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Apply { rule, reply }).await?;
        rx.await.map_err(|_| StreamError::EngineStopped)?
    }

    /// Remove one stream; `all` or `deleteAll` removes every stream
    ///
    /// Returns how many streams were removed.
    pub async fn remove(&self, stream: &str) -> Result<usize, StreamError> {
        if stream == "all" || stream == DELETE_ALL {
            return self.remove_all().await;
        }
        let Ok(stream) = Topic::parse(stream) else {
            return Ok(0);
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove { stream, reply }).await?;
        rx.await.map_err(|_| StreamError::EngineStopped)
    }

    pub async fn remove_all(&self) -> Result<usize, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveAll { reply }).await?;
        rx.await.map_err(|_| StreamError::EngineStopped)
    }

    /// Every installed stream rule, ordered by stream
    pub async fn streams(&self) -> Result<Vec<StreamRule>, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| StreamError::EngineStopped)
    }

    pub async fn stream(&self, stream: &str) -> Result<Option<StreamRule>, StreamError> {
        let Ok(stream) = Topic::parse(stream) else {
            return Ok(None);
        };
        Ok(self.streams().await?.into_iter().find(|rule| rule.stream == stream))
    }

    async fn send(&self, command: Command) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| StreamError::EngineStopped)
    }
}

struct Aggregator {
    rule: StreamRule,
    cancel: CancellationToken,
    feeds: Vec<JoinHandle<()>>,
}

impl Aggregator {
    /// Stop every feed task and wait until their clients are unsubscribed
    async fn shutdown(self) {
        self.cancel.cancel();
        for feed in self.feeds {
            let _ = feed.await;
        }
        debug!(stream = %self.rule.stream, "Aggregator stopped");
    }
}

struct EngineTask {
    hub: Hub,
    outbox: usize,
    streams: BTreeMap<Topic, Aggregator>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl EngineTask {
    async fn run(mut self) {
        info!("Stream engine started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle(command).await,
                else => break,
            }
        }

        let removed = self.remove_all().await;
        info!(removed, "Stream engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Apply { rule, reply } => {
                let _ = reply.send(self.apply(rule).await);
            }
            Command::Remove { stream, reply } => {
                let removed = match self.streams.remove(&stream) {
                    Some(aggregator) => {
                        aggregator.shutdown().await;
                        info!(stream = %stream, "Stream removed");
                        1
                    }
                    None => 0,
                };
                let _ = reply.send(removed);
            }
            Command::RemoveAll { reply } => {
                let _ = reply.send(self.remove_all().await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.streams.values().map(|a| a.rule.clone()).collect());
            }
        }
    }

    /// True if `rule.stream` already flows, through other streams, into one
    /// of `rule.feeds`
    fn would_cycle(&self, rule: &StreamRule) -> bool {
        let mut pending = vec![rule.stream.clone()];
        let mut seen = HashSet::new();

        while let Some(topic) = pending.pop() {
            if rule.feeds.contains(&topic) {
                return true;
            }
            if !seen.insert(topic.clone()) {
                continue;
            }

            for other in self.streams.values() {
                if other.rule.stream != rule.stream && other.rule.feeds.contains(&topic) {
                    pending.push(other.rule.stream.clone());
                }
            }
        }

        false
    }

    async fn apply(&mut self, rule: StreamRule) -> Result<(), StreamError> {
        if self.would_cycle(&rule) {
            return Err(StreamError::Cycle(rule.stream.to_string()));
        }

        if let Some(old) = self.streams.remove(&rule.stream) {
            info!(stream = %rule.stream, "Replacing existing stream");
            old.shutdown().await;
        }

        let name = format!("stream:{}", rule.stream);
        let publisher = self.hub.publisher(name.clone(), rule.stream.clone());
        let cancel = self.shutdown.child_token();

        let mut feeds = Vec::with_capacity(rule.feeds.len());
        for feed in rule.feeds.clone() {
            let spec = ClientSpec::new(name.clone(), feed).capacity(self.outbox);
            let client = match self.hub.subscribe(spec).await {
                Ok(client) => client,
                Err(e) => {
                    Aggregator { rule, cancel, feeds }.shutdown().await;
                    return Err(e.into());
                }
            };
            feeds.push(tokio::spawn(forward(client, publisher.clone(), cancel.clone())));
        }

        info!(stream = %rule.stream, feeds = rule.feeds.len(), "Stream applied");
        self.streams
            .insert(rule.stream.clone(), Aggregator { rule, cancel, feeds });

        Ok(())
    }

    async fn remove_all(&mut self) -> usize {
        let streams = std::mem::take(&mut self.streams);
        let count = streams.len();

        for aggregator in streams.into_values() {
            aggregator.shutdown().await;
        }

        if count > 0 {
            info!(count, "All streams removed");
        }
        count
    }
}

/// One feed's messages, republished on the stream
async fn forward(mut client: Client, publisher: Publisher, cancel: CancellationToken) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            msg = client.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            published = publisher.publish(msg.opcode, msg.payload) => {
                if published.is_err() {
                    break;
                }
            }
        }
    }

    let feed = client.topic().clone();
    if let Err(e) = client.unsubscribe().await {
        debug!(feed = %feed, error = %e, "Unsubscribe after aggregator stop failed");
    }
}
