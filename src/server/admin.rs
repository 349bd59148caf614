//! JSON control plane for relay and stream rules
//!
//! Commands look like
//! `{"verb":"add","what":"destination","rule":{"id":..,"stream":..,"destination":..,"token":..}}`
//! or `{"verb":"add","what":"stream","rule":{"stream":..,"feeds":[..]}}`.
//! They arrive on the admin topic and the reply (or the error text) is
//! published back onto the same topic.

use crate::aggregate::{StreamEngine, StreamError, StreamRule};
use crate::hub::{ClientSpec, Hub, HubError, Opcode};
use crate::relay::{Rule, RuleEngine, RuleError, DELETE_ALL};
use crate::topics::{Topic, TopicError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid command: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("could not encode reply: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unrecognised command")]
    BadCommand,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Add,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum What {
    Destination,
    Stream,
}

/// Rule as it appears in a command; only `add` needs every field
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFields {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub feeds: Option<Vec<String>>,
}

impl RuleFields {
    fn into_rule(self) -> Result<Rule, AdminError> {
        let id = self.id.ok_or(AdminError::MissingField("id"))?;
        let stream = self.stream.ok_or(AdminError::MissingField("stream"))?;
        let destination = self.destination.ok_or(AdminError::MissingField("destination"))?;

        let mut rule = Rule::new(id, Topic::parse(&stream)?, destination);
        rule.token = self.token;
        Ok(rule)
    }

    fn into_stream_rule(self) -> Result<StreamRule, AdminError> {
        let stream = self.stream.ok_or(AdminError::MissingField("stream"))?;
        let feeds = self.feeds.ok_or(AdminError::MissingField("feeds"))?;

        let feeds = feeds
            .iter()
            .map(|feed| Topic::parse(feed))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StreamRule::new(Topic::parse(&stream)?, feeds))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub verb: Verb,
    pub what: What,
    #[serde(default)]
    pub which: Option<String>,
    #[serde(default)]
    pub rule: Option<RuleFields>,
}

impl Command {
    /// Target of a delete or list: `which`, falling back to the rule's id
    /// (destinations) or stream (streams)
    fn target(&self) -> Option<&str> {
        let from_rule = self.rule.as_ref().and_then(|r| match self.what {
            What::Destination => r.id.as_deref(),
            What::Stream => r.stream.as_deref(),
        });

        self.which
            .as_deref()
            .or(from_rule)
            .filter(|t| !t.is_empty())
    }
}

/// The engines a command can act on
#[derive(Clone)]
pub struct Engines {
    pub rules: RuleEngine,
    pub streams: StreamEngine,
}

fn encode<T: Serialize>(value: &T) -> Result<Value, AdminError> {
    serde_json::to_value(value).map_err(AdminError::Encode)
}

/// Parse and run one raw command
pub async fn handle_admin_message(engines: &Engines, data: &[u8]) -> Result<Value, AdminError> {
    let command: Command = serde_json::from_slice(data).map_err(AdminError::Parse)?;
    handle_command(engines, command).await
}

pub async fn handle_command(engines: &Engines, command: Command) -> Result<Value, AdminError> {
    match command.what {
        What::Destination => handle_destination(&engines.rules, command).await,
        What::Stream => handle_stream(&engines.streams, command).await,
    }
}

async fn handle_destination(rules: &RuleEngine, command: Command) -> Result<Value, AdminError> {
    match command.verb {
        Verb::Add => {
            let fields = command.rule.ok_or(AdminError::MissingField("rule"))?;
            let rule = fields.into_rule()?.validated()?;
            rules.apply(rule.clone()).await?;
            encode(&rule)
        }
        Verb::Delete => {
            let target = command.target().ok_or(AdminError::BadCommand)?;
            if target == "all" || target == DELETE_ALL {
                rules.remove_all().await?;
                Ok(json!(DELETE_ALL))
            } else {
                rules.remove(target).await?;
                Ok(json!(target))
            }
        }
        Verb::List => {
            let target = command.target().ok_or(AdminError::BadCommand)?;
            if target == "all" {
                let mut all = Map::new();
                for rule in rules.rules().await? {
                    all.insert(rule.id.clone(), encode(&rule)?);
                }
                Ok(Value::Object(all))
            } else {
                encode(&rules.rule(target).await?)
            }
        }
    }
}

async fn handle_stream(streams: &StreamEngine, command: Command) -> Result<Value, AdminError> {
    match command.verb {
        Verb::Add => {
            let fields = command.rule.ok_or(AdminError::MissingField("rule"))?;
            let rule = fields.into_stream_rule()?.validated()?;
            streams.apply(rule.clone()).await?;
            encode(&rule)
        }
        Verb::Delete => {
            let target = command.target().ok_or(AdminError::BadCommand)?;
            if target == "all" || target == DELETE_ALL {
                streams.remove_all().await?;
                Ok(json!(DELETE_ALL))
            } else {
                streams.remove(target).await?;
                Ok(json!(target))
            }
        }
        Verb::List => {
            let target = command.target().ok_or(AdminError::BadCommand)?;
            if target == "all" {
                let mut all = Map::new();
                for rule in streams.streams().await? {
                    all.insert(rule.stream.to_string(), encode(&rule.feeds)?);
                }
                Ok(Value::Object(all))
            } else {
                encode(&streams.stream(target).await?)
            }
        }
    }
}

/// Subscribe to the admin topic and answer every command published on it
pub async fn spawn_admin_listener(
    hub: &Hub,
    engines: Engines,
    topic: Topic,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, HubError> {
    let mut client = hub.subscribe(ClientSpec::new("admin", topic.clone())).await?;
    info!(topic = %topic, "Admin listener started");

    Ok(tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = client.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let reply = match handle_admin_message(&engines, &msg.payload).await {
                Ok(value) => value.to_string(),
                Err(e) => {
                    warn!(sender = %msg.sender.name, error = %e, "Admin command failed");
                    e.to_string()
                }
            };
            debug!(sender = %msg.sender.name, "Admin command handled");

            if client.publish(Opcode::Text, reply).await.is_err() {
                break;
            }
        }

        debug!("Admin listener stopped");
    }))
}
