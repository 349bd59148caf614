//! Relay rules

use crate::topics::Topic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved id meaning "every rule" in delete requests
pub const DELETE_ALL: &str = "deleteAll";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule id cannot be empty")]
    EmptyId,

    #[error("rule id '{0}' is reserved")]
    ReservedId(String),

    #[error("invalid destination '{0}': must be a ws:// or wss:// URL")]
    InvalidDestination(String),

    #[error("no rule with id '{0}'")]
    NotFound(String),

    #[error("rule engine is not running")]
    EngineStopped,
}

/// Relay everything published on `stream` to the websocket at `destination`
///
/// The token is sent as a bearer token in the handshake. It is never
/// serialized back out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub stream: Topic,
    pub destination: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl Rule {
    pub fn new(id: impl Into<String>, stream: Topic, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream,
            destination: destination.into(),
            token: None,
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Check the rule and normalise it for installation
    pub fn validated(mut self) -> Result<Self, RuleError> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return Err(RuleError::EmptyId);
        }
        if self.id == DELETE_ALL {
            return Err(RuleError::ReservedId(self.id));
        }

        let destination = self.destination.trim();
        let host = destination
            .strip_prefix("ws://")
            .or_else(|| destination.strip_prefix("wss://"));
        if host.map_or(true, |h| h.is_empty() || h.starts_with('/')) {
            return Err(RuleError::InvalidDestination(self.destination));
        }
        self.destination = destination.to_string();

        if self.token.as_deref().is_some_and(str::is_empty) {
            self.token = None;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, destination: &str) -> Rule {
        Rule::new(id, Topic::parse("video0").unwrap(), destination)
    }

    #[test]
    fn test_rule_validated() {
        let r = rule(" r1 ", "wss://relay.example.com/in/video0")
            .token("")
            .validated()
            .unwrap();

        assert_eq!(r.id, "r1");
        assert!(r.token.is_none());
    }

    #[test]
    fn test_rule_rejects_reserved_and_empty_id() {
        assert_eq!(rule("", "ws://host/x").validated(), Err(RuleError::EmptyId));
        assert_eq!(
            rule(DELETE_ALL, "ws://host/x").validated(),
            Err(RuleError::ReservedId(DELETE_ALL.to_string()))
        );
    }

    #[test]
    fn test_rule_rejects_bad_destination() {
        assert!(rule("r1", "http://host/x").validated().is_err());
        assert!(rule("r1", "ws://").validated().is_err());
        assert!(rule("r1", "ws:///path").validated().is_err());
        assert!(rule("r1", "localhost:8888").validated().is_err());
    }

    #[test]
    fn test_rule_deserialize() {
        let r: Rule = serde_json::from_str(
            r#"{"id":"a1","stream":"/audio","destination":"ws://host/in","token":"abc"}"#,
        )
        .unwrap();

        assert_eq!(r.stream.as_str(), "audio");
        assert_eq!(r.token.as_deref(), Some("abc"));

        let r: Rule =
            serde_json::from_str(r#"{"id":"a2","stream":"audio","destination":"ws://host/in"}"#)
                .unwrap();
        assert!(r.token.is_none());
    }

    #[test]
    fn test_rule_serialize_hides_token() {
        let r = rule("r1", "ws://host/in").token("secret");
        let json = serde_json::to_value(&r).unwrap();

        assert_eq!(json["id"], "r1");
        assert_eq!(json["stream"], "video0");
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_rule_rejects_bad_stream() {
        let result = serde_json::from_str::<Rule>(
            r#"{"id":"a1","stream":"","destination":"ws://host/in"}"#,
        );
        assert!(result.is_err());
    }
}
