//! Client and publisher handles

use super::{ClientId, ClientInfo, Control, HubError, Message, Opcode};
use crate::hub::stats::ClientStats;
use crate::topics::Topic;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Publish-side identity of a client
///
/// Cheap to clone. Every message published through it carries the same
/// sender, so the hub skips the matching subscriber when fanning out.
#[derive(Clone)]
pub struct Publisher {
    info: Arc<ClientInfo>,
    stats: Arc<ClientStats>,
    data: mpsc::Sender<Message>,
}

impl Publisher {
    pub(super) fn new(info: Arc<ClientInfo>, stats: Arc<ClientStats>, data: mpsc::Sender<Message>) -> Self {
        Self { info, stats, data }
    }

    pub fn info(&self) -> &Arc<ClientInfo> {
        &self.info
    }

    pub fn topic(&self) -> &Topic {
        &self.info.topic
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    /// Publish to every other subscriber of this topic
    ///
    /// Waits only for room in the hub mailbox, never for subscribers.
    pub async fn publish(&self, opcode: Opcode, payload: impl Into<Bytes>) -> Result<(), HubError> {
        let payload = payload.into();
        let len = payload.len();

        let msg = Message {
            sender: self.info.clone(),
            opcode,
            payload,
            sent: Instant::now(),
        };
        self.data.send(msg).await.map_err(|_| HubError::Closed)?;

        self.stats.record_tx(len);
        Ok(())
    }
}

/// A subscribed client
///
/// Owns the receiving end of the outbox. Dropping it unregisters the client
/// without waiting; [`Client::unsubscribe`] waits for the hub to confirm.
pub struct Client {
    outbox: mpsc::Receiver<Message>,
    publisher: Publisher,
    control: mpsc::UnboundedSender<Control>,
    registered: bool,
}

impl Client {
    pub(super) fn new(
        outbox: mpsc::Receiver<Message>,
        publisher: Publisher,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            outbox,
            publisher,
            control,
            registered: true,
        }
    }

    pub fn id(&self) -> ClientId {
        self.publisher.info.id
    }

    pub fn name(&self) -> &str {
        &self.publisher.info.name
    }

    pub fn topic(&self) -> &Topic {
        &self.publisher.info.topic
    }

    pub fn info(&self) -> &Arc<ClientInfo> {
        &self.publisher.info
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.publisher.stats
    }

    /// Next message from the outbox
    ///
    /// Returns `None` once the hub has evicted this client or stopped.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.outbox.recv().await?;
        self.publisher.stats.record_rx(msg.payload.len());
        Some(msg)
    }

    pub async fn publish(&self, opcode: Opcode, payload: impl Into<Bytes>) -> Result<(), HubError> {
        self.publisher.publish(opcode, payload).await
    }

    /// A publisher sharing this client's identity
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Unregister and wait for the hub to acknowledge
    pub async fn unsubscribe(mut self) -> Result<(), HubError> {
        self.registered = false;

        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Unregister {
                id: self.id(),
                topic: self.topic().clone(),
                ack: Some(ack),
            })
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.registered {
            let _ = self.control.send(Control::Unregister {
                id: self.id(),
                topic: self.topic().clone(),
                ack: None,
            });
        }
    }
}
