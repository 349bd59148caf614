//! Messages carried over the inbound and outbound channels

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

/// Websocket data frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Binary,
}

/// A data message read from, or to be written to, the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub data: Bytes,
    pub kind: MessageKind,
}

impl WsMessage {
    pub fn new(data: impl Into<Bytes>, kind: MessageKind) -> Self {
        Self {
            data: data.into(),
            kind,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(data, MessageKind::Binary)
    }

    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(data, MessageKind::Text)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Convert into a websocket frame; invalid UTF-8 in text is replaced
    pub(crate) fn into_message(self) -> Message {
        match self.kind {
            MessageKind::Binary => Message::binary(self.data),
            MessageKind::Text => Message::text(String::from_utf8_lossy(&self.data).into_owned()),
        }
    }

    /// Data frames only; control frames yield `None`
    pub(crate) fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Binary(data) => Some(Self::binary(data)),
            Message::Text(text) => Some(Self::text(Bytes::copy_from_slice(text.as_str().as_bytes()))),
            _ => None,
        }
    }
}
