//! Topic naming
//!
//! A topic is the routing key for a stream. It comes from a URL path, so
//! `/video0`, `video0` and `video0/` all name the same topic. Apart from
//! that normalisation a topic is opaque: equality is exact string match
//! and inner `/` characters are kept as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic name cannot be empty")]
    Empty,

    #[error("invalid character {0:?} in topic name")]
    InvalidChar(char),
}

/// A validated topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(Arc<str>);

impl Topic {
    /// Parse and normalise a topic name
    pub fn parse(name: &str) -> Result<Self, TopicError> {
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(TopicError::Empty);
        }

        if let Some(c) = name.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(TopicError::InvalidChar(c));
        }

        Ok(Self(Arc::from(name)))
    }

    /// Derive a topic from a request path, dropping a route prefix
    ///
    /// `from_path("/ts/video0", "ts")` yields `video0`.
    pub fn from_path(path: &str, prefix: &str) -> Result<Self, TopicError> {
        let path = path.trim_start_matches('/');
        let rest = path
            .strip_prefix(prefix)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(path);
        Self::parse(rest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0.to_string()
    }
}
