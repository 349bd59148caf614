//! Relay hub - transport stream ingest, topic pub/sub and websocket relays
//!
//! MPEG-TS arrives as long-lived HTTP request bodies, gets cut back into
//! whole packets, and is fanned out through a topic hub to websocket
//! subscribers, into aggregate streams, and to outbound relays driven by a
//! live set of rules.

pub mod aggregate;
pub mod config;
pub mod framer;
pub mod hub;
pub mod relay;
pub mod server;
pub mod topics;

pub use aggregate::{StreamEngine, StreamError, StreamRule};
pub use config::Config;
pub use framer::{FrameBuffer, FramerConfig};
pub use hub::{Backpressure, Client, ClientSpec, Hub, HubError, Message, Opcode, Publisher};
pub use relay::{Rule, RuleEngine, RuleError};
pub use server::RelayServer;
pub use topics::{Topic, TopicError};
