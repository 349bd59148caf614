//! Reconnecting websocket client
//!
//! Dials a websocket URL and keeps dialing it, with exponential backoff, until
//! told to stop. Bytes flow through two channels: `Out` (written to the socket,
//! one message at a time, in order) and `In` (read from the socket).
//!
//! # Example
//!
//! ```no_run
//! use reconws::{ReconWs, ReconWsConfig, WsMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReconWsConfig::new("wss://relay.example.com/in/video0")
//!         .token("secret-token");
//!     let mut ws = ReconWs::spawn(config);
//!
//!     ws.send(WsMessage::binary(vec![0x47; 188])).await?;
//!
//!     while let Some(msg) = ws.recv().await {
//!         println!("received {} bytes", msg.len());
//!     }
//!
//!     ws.stop();
//!     Ok(())
//! }
//! ```

mod backoff;
mod client;
mod config;
mod error;
mod messages;

pub use backoff::Backoff;
pub use client::{ConnectionState, Metrics, ReconWs, ReconWsHandle};
pub use config::{ReconWsConfig, RetryConfig};
pub use error::{ReconWsError, Result};
pub use messages::{MessageKind, WsMessage};
