//! Runtime configuration

use crate::framer::FramerConfig;
use crate::hub::DEFAULT_CLIENT_CAPACITY;
use crate::relay::RelaySettings;
use crate::topics::Topic;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_HUB_MAILBOX: usize = 10;
pub const DEFAULT_HTTP_WAIT: Duration = Duration::from_millis(5000);
pub const DEFAULT_ADMIN_TOPIC: &str = "admin";

/// Everything the server needs to start
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on
    pub bind: SocketAddr,

    /// Capacity of the hub's broadcast mailbox
    pub hub_mailbox: usize,

    /// Outbox capacity for ingest and websocket clients
    pub client_outbox: usize,

    /// Outbox capacity and reconnect timing for relays
    pub relay: RelaySettings,

    pub framer: FramerConfig,

    /// How long in-flight requests get to finish on shutdown
    pub http_wait: Duration,

    /// Topic the admin listener subscribes to; `None` disables it
    pub admin_topic: Option<Topic>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            hub_mailbox: DEFAULT_HUB_MAILBOX,
            client_outbox: DEFAULT_CLIENT_CAPACITY,
            relay: RelaySettings::default(),
            framer: FramerConfig::default(),
            http_wait: DEFAULT_HTTP_WAIT,
            admin_topic: Topic::parse(DEFAULT_ADMIN_TOPIC).ok(),
        }
    }
}
