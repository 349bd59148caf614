//! Reconnecting websocket client implementation

use crate::backoff::Backoff;
use crate::config::ReconWsConfig;
use crate::error::{ReconWsError, Result};
use crate::messages::WsMessage;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Waiting out a backoff delay, or not yet started
    Disconnected,
    /// Dialing and handshaking
    Connecting,
    /// Socket open, outbound messages are being written
    Connected,
    /// Stopped for good
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicU64,
    dial_failures: AtomicU64,
    disconnects: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Metrics {
        Metrics {
            connects: self.connects.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Successful handshakes
    pub connects: u64,
    /// Dial or handshake attempts that failed
    pub dial_failures: u64,
    /// Open connections that were lost
    pub disconnects: u64,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Outbound messages dropped because no connection was open
    pub discarded: u64,
}

/// Cloneable view of a running client
#[derive(Debug, Clone)]
pub struct ReconWsHandle {
    url: Arc<str>,
    state: watch::Receiver<ConnectionState>,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

impl ReconWsHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn metrics(&self) -> Metrics {
        self.counters.snapshot()
    }

    /// Ask the client to stop; returns immediately
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the connection loop has exited
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // A closed watch means the loop is gone
        let _ = state
            .wait_for(|s| *s == ConnectionState::Terminated)
            .await;
    }
}

/// Reconnecting websocket client
///
/// Owns the `Out` sender and the `In` receiver. Messages sent while no
/// connection is open are discarded. Dropping every `Out` sender stops the
/// client, as does [`ReconWs::stop`] or cancelling the token passed to
/// [`ReconWs::spawn_with_cancel`].
pub struct ReconWs {
    out: mpsc::Sender<WsMessage>,
    inbound: mpsc::Receiver<WsMessage>,
    handle: ReconWsHandle,
}

impl ReconWs {
    /// Start the connection loop on the current runtime
    pub fn spawn(config: ReconWsConfig) -> Self {
        Self::spawn_with_cancel(config, CancellationToken::new())
    }

    /// Start the connection loop, stopping when `stop` is cancelled
    pub fn spawn_with_cancel(config: ReconWsConfig, stop: CancellationToken) -> Self {
        let (out_tx, out_rx) = mpsc::channel(config.out_buffer.max(1));
        let (in_tx, in_rx) = mpsc::channel(config.in_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let counters = Arc::new(Counters::default());

        let handle = ReconWsHandle {
            url: Arc::from(config.url.as_str()),
            state: state_rx,
            counters: counters.clone(),
            stop: stop.clone(),
        };

        let task = ConnectionTask {
            backoff: Backoff::new(config.retry.clone()),
            config,
            out_rx,
            in_tx,
            state: state_tx,
            counters,
            stop,
        };
        tokio::spawn(task.run());

        Self {
            out: out_tx,
            inbound: in_rx,
            handle,
        }
    }

    /// Get a sender for the `Out` channel
    pub fn sender(&self) -> mpsc::Sender<WsMessage> {
        self.out.clone()
    }

    /// Queue a message for the socket
    ///
    /// Waits while the `Out` channel is full. Fails only once the client has
    /// stopped.
    pub async fn send(&self, msg: WsMessage) -> Result<()> {
        self.out.send(msg).await.map_err(|_| ReconWsError::Stopped)
    }

    /// Receive the next message read from the socket
    ///
    /// Returns `None` once the client has stopped.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        self.inbound.recv().await
    }

    pub fn handle(&self) -> &ReconWsHandle {
        &self.handle
    }

    /// Split into the `Out` sender, the `In` receiver and a handle
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<WsMessage>,
        mpsc::Receiver<WsMessage>,
        ReconWsHandle,
    ) {
        (self.out, self.inbound, self.handle)
    }

    pub fn stop(&self) {
        self.handle.stop();
    }
}

enum Dial {
    Connected(Box<Socket>),
    Failed(ReconWsError),
    Stopped,
}

enum Pump {
    Stopped,
    Lost(Option<ReconWsError>),
}

struct ConnectionTask {
    config: ReconWsConfig,
    backoff: Backoff,
    out_rx: mpsc::Receiver<WsMessage>,
    in_tx: mpsc::Sender<WsMessage>,
    state: watch::Sender<ConnectionState>,
    counters: Arc<Counters>,
    stop: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self) {
        info!(url = %self.config.url, "Websocket client started");

        loop {
            self.set_state(ConnectionState::Connecting);

            match self.dial().await {
                Dial::Connected(socket) => {
                    self.backoff.reset();
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    info!(url = %self.config.url, "Websocket connected");

                    match self.pump(*socket).await {
                        Pump::Stopped => break,
                        Pump::Lost(reason) => {
                            self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                            match reason {
                                Some(e) => warn!(url = %self.config.url, error = %e, "Connection lost"),
                                None => info!(url = %self.config.url, "Connection closed by server"),
                            }
                        }
                    }
                }
                Dial::Failed(e) => {
                    self.counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %self.config.url, attempt = self.backoff.attempt() + 1, error = %e, "Dial failed");
                }
                Dial::Stopped => break,
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.backoff.duration();
            debug!(url = %self.config.url, ?delay, "Reconnecting after delay");
            if !self.wait(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Terminated);
        info!(url = %self.config.url, "Websocket client stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(url = %self.config.url, from = %previous, to = %state, "State change");
        }
    }

    fn discard(&self, msg: &WsMessage) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.config.url, len = msg.len(), "Discarding message, not connected");
    }

    async fn dial(&mut self) -> Dial {
        let request = match build_request(&self.config) {
            Ok(request) => request,
            Err(e) => return Dial::Failed(e),
        };

        let handshake = self.config.retry.handshake_timeout;
        let connect = timeout(handshake, connect_async(request));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Dial::Stopped,
                result = &mut connect => {
                    return match result {
                        Ok(Ok((socket, _response))) => Dial::Connected(Box::new(socket)),
                        Ok(Err(e)) => Dial::Failed(ReconWsError::Connection(e.to_string())),
                        Err(_) => Dial::Failed(ReconWsError::HandshakeTimeout(handshake)),
                    };
                }
                msg = self.out_rx.recv() => match msg {
                    Some(msg) => self.discard(&msg),
                    None => return Dial::Stopped,
                },
            }
        }
    }

    /// Sleep out the backoff delay; false means stop
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                _ = &mut sleep => return true,
                msg = self.out_rx.recv() => match msg {
                    Some(msg) => self.discard(&msg),
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, socket: Socket) -> Pump {
        let (mut sink, stream) = socket.split();
        let conn_done = self.stop.child_token();

        let in_tx = self.config.forward_inbound.then(|| self.in_tx.clone());
        let reader = tokio::spawn(read_pump(
            stream,
            in_tx,
            self.counters.clone(),
            conn_done.clone(),
        ));

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.stop.cancelled() => {
                    close(&mut sink).await;
                    break Pump::Stopped;
                }
                _ = conn_done.cancelled() => break Pump::Lost(None),
                msg = self.out_rx.recv() => {
                    let Some(msg) = msg else {
                        close(&mut sink).await;
                        break Pump::Stopped;
                    };

                    let len = msg.len() as u64;
                    let written = tokio::select! {
                        _ = self.stop.cancelled() => None,
                        result = sink.send(msg.into_message()) => Some(result),
                    };
                    let Some(written) = written else {
                        close(&mut sink).await;
                        break Pump::Stopped;
                    };
                    if let Err(e) = written {
                        break Pump::Lost(Some(ReconWsError::Transport(e.to_string())));
                    }
                    self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                }
            }
        };

        conn_done.cancel();
        let read_error = reader.await.ok().flatten();

        match outcome {
            Pump::Lost(None) => Pump::Lost(read_error),
            other => other,
        }
    }
}

async fn close(sink: &mut SplitSink<Socket, Message>) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static(""),
    };
    let _ = timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
}

/// Read until the connection ends or `done` fires, then cancel `done`
async fn read_pump(
    mut stream: SplitStream<Socket>,
    mut in_tx: Option<mpsc::Sender<WsMessage>>,
    counters: Arc<Counters>,
    done: CancellationToken,
) -> Option<ReconWsError> {
    let reason = loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break None,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Close frame received");
                break None;
            }
            Some(Ok(msg)) => {
                let Some(msg) = WsMessage::from_message(msg) else {
                    continue;
                };
                counters.messages_received.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_received
                    .fetch_add(msg.len() as u64, Ordering::Relaxed);

                if let Some(tx) = &in_tx {
                    let forwarded = tokio::select! {
                        _ = done.cancelled() => break None,
                        result = tx.send(msg) => result.is_ok(),
                    };
                    if !forwarded {
                        // Nobody reads the In channel any more
                        in_tx = None;
                    }
                }
            }
            Some(Err(e)) => break Some(ReconWsError::Transport(e.to_string())),
            None => break None,
        }
    };

    done.cancel();
    reason
}

fn build_request(config: &ReconWsConfig) -> Result<Request> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ReconWsError::InvalidUrl(format!("{}: {}", config.url, e)))?;

    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ReconWsError::InvalidToken(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    Ok(request)
}
