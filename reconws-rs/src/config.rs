//! Configuration for the reconnecting websocket client

use std::time::Duration;

/// Backoff and handshake timing for reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Shortest wait between attempts
    pub min: Duration,

    /// Longest wait between attempts
    pub max: Duration,

    /// Growth factor applied per failed attempt
    pub factor: f64,

    /// Randomise each wait between `min` and the computed delay
    pub jitter: bool,

    /// Maximum time allowed for dial plus websocket handshake
    pub handshake_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: false,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Set the backoff bounds
    pub fn bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Set the growth factor
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Enable or disable jitter
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Configuration for one reconnecting websocket client
#[derive(Debug, Clone)]
pub struct ReconWsConfig {
    /// Destination URL (ws:// or wss://)
    pub url: String,

    /// Bearer token sent in the handshake, if any
    pub token: Option<String>,

    /// Retry timing
    pub retry: RetryConfig,

    /// Push messages read from the socket onto the inbound channel
    pub forward_inbound: bool,

    /// Capacity of the outbound channel
    pub out_buffer: usize,

    /// Capacity of the inbound channel
    pub in_buffer: usize,
}

impl ReconWsConfig {
    /// Create a configuration for the given URL with default timing
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            retry: RetryConfig::default(),
            forward_inbound: true,
            out_buffer: 2,
            in_buffer: 2,
        }
    }

    /// Send `Authorization: Bearer <token>` during the handshake
    ///
    /// An empty token is treated as no token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
        self
    }

    /// Set the retry timing
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Stop forwarding inbound socket messages
    pub fn discard_inbound(mut self) -> Self {
        self.forward_inbound = false;
        self
    }

    /// Set the outbound and inbound channel capacities
    pub fn buffers(mut self, out_buffer: usize, in_buffer: usize) -> Self {
        self.out_buffer = out_buffer;
        self.in_buffer = in_buffer;
        self
    }
}
