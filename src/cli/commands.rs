//! CLI command definitions

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relayhub::config::Config;
use relayhub::framer::FramerConfig;
use relayhub::relay::{RelaySettings, Rule};
use relayhub::topics::Topic;
use reconws::RetryConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "relayhub")]
#[command(about = "Transport stream relay hub", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, env = "RELAYHUB_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay hub
    Serve(ServeArgs),

    /// Validate a rules file without starting anything
    ///
    /// Examples:
    ///   relayhub check rules.json
    Check {
        /// JSON array of rules
        rules: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8888", env = "RELAYHUB_BIND")]
    pub bind: String,

    /// Capacity of the hub's broadcast mailbox
    #[arg(long, default_value_t = 10, env = "RELAYHUB_HUB_MAILBOX")]
    pub hub_mailbox: usize,

    /// Outbox capacity for ingest and websocket clients
    #[arg(long, default_value_t = 5, env = "RELAYHUB_CLIENT_OUTBOX")]
    pub client_outbox: usize,

    /// Outbox capacity for relay clients
    #[arg(long, default_value_t = 2, env = "RELAYHUB_RELAY_OUTBOX")]
    pub relay_outbox: usize,

    /// Framer flush interval in milliseconds
    #[arg(long, default_value_t = 5, env = "RELAYHUB_FLUSH_MS")]
    pub flush_ms: u64,

    /// Largest window kept while searching for a sync byte
    #[arg(long, default_value_t = 1_024_000, env = "RELAYHUB_MAX_FRAME_BYTES")]
    pub max_frame_bytes: usize,

    /// How long in-flight requests get on shutdown, in milliseconds
    #[arg(long, default_value_t = 5000, env = "RELAYHUB_HTTP_WAIT_MS")]
    pub http_wait_ms: u64,

    /// Shortest reconnect delay in milliseconds
    #[arg(long, default_value_t = 500, env = "RELAYHUB_RETRY_MIN_MS")]
    pub retry_min_ms: u64,

    /// Longest reconnect delay in milliseconds
    #[arg(long, default_value_t = 10_000, env = "RELAYHUB_RETRY_MAX_MS")]
    pub retry_max_ms: u64,

    /// Reconnect delay multiplier
    #[arg(long, default_value_t = 2.0, value_parser = parse_factor, env = "RELAYHUB_RETRY_FACTOR")]
    pub retry_factor: f64,

    /// Randomize reconnect delays
    #[arg(long, env = "RELAYHUB_RETRY_JITTER")]
    pub retry_jitter: bool,

    /// Websocket handshake timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "RELAYHUB_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: u64,

    /// Topic answering JSON admin commands
    #[arg(long, default_value = "admin", env = "RELAYHUB_ADMIN_TOPIC")]
    pub admin_topic: String,

    /// Do not start the admin topic listener
    #[arg(long, env = "RELAYHUB_NO_ADMIN")]
    pub no_admin: bool,

    /// Rules to apply at startup (JSON array)
    #[arg(long, env = "RELAYHUB_RULES")]
    pub rules: Option<PathBuf>,
}

impl ServeArgs {
    pub fn to_config(&self) -> Result<Config> {
        let bind: SocketAddr = self.bind.parse().context("Invalid bind address")?;

        let admin_topic = if self.no_admin {
            None
        } else {
            Some(Topic::parse(&self.admin_topic).context("Invalid admin topic")?)
        };

        let retry = RetryConfig::default()
            .bounds(
                Duration::from_millis(self.retry_min_ms),
                Duration::from_millis(self.retry_max_ms),
            )
            .factor(self.retry_factor)
            .jitter(self.retry_jitter)
            .handshake_timeout(Duration::from_millis(self.handshake_timeout_ms));

        Ok(Config {
            bind,
            hub_mailbox: self.hub_mailbox.max(1),
            client_outbox: self.client_outbox.max(1),
            relay: RelaySettings {
                outbox: self.relay_outbox.max(1),
                retry,
            },
            framer: FramerConfig {
                flush_interval: Duration::from_millis(self.flush_ms),
                max_frame_bytes: self.max_frame_bytes,
                ..FramerConfig::default()
            },
            http_wait: Duration::from_millis(self.http_wait_ms),
            admin_topic,
        })
    }
}

/// Read a JSON array of rules and validate each one
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read rules: {:?}", path))?;
    let rules: Vec<Rule> =
        serde_json::from_slice(&data).with_context(|| format!("Invalid rules file: {:?}", path))?;

    rules
        .into_iter()
        .map(|rule| {
            let id = rule.id.clone();
            rule.validated().with_context(|| format!("Invalid rule '{}'", id))
        })
        .collect()
}

fn parse_factor(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f >= 1.0 => Ok(f),
        _ => Err(format!("Invalid retry factor: {}. Must be a number >= 1", s)),
    }
}
