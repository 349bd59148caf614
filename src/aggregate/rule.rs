//! Stream aggregation rules

use crate::topics::Topic;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream '{0}' has no feeds")]
    NoFeeds(String),

    #[error("stream '{0}' cannot be one of its own feeds")]
    SelfFeed(String),

    #[error("stream '{0}' would feed back into itself")]
    Cycle(String),

    #[error("no stream named '{0}'")]
    NotFound(String),

    #[error("stream engine is not running")]
    EngineStopped,
}

/// Republish everything published on any of `feeds` onto `stream`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRule {
    pub stream: Topic,
    pub feeds: Vec<Topic>,
}

impl StreamRule {
    pub fn new(stream: Topic, feeds: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            stream,
            feeds: feeds.into_iter().collect(),
        }
    }

    /// Drop duplicate feeds (keeping first-seen order) and reject rules that
    /// cannot be installed
    pub fn validated(mut self) -> Result<Self, StreamError> {
        let mut seen = HashSet::new();
        self.feeds.retain(|feed| seen.insert(feed.clone()));

        if self.feeds.is_empty() {
            return Err(StreamError::NoFeeds(self.stream.to_string()));
        }
        if self.feeds.contains(&self.stream) {
            return Err(StreamError::SelfFeed(self.stream.to_string()));
        }

        Ok(self)
    }
}
