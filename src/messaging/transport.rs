//! Seams between the AMQP core and the broker client library.
//!
//! The supervisor, publisher and subscriber only talk to these traits; the
//! `lapin` implementation lives in `rabbit_client`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{ConnectionParams, OutboundMessage};

/// Dials broker connections.
#[async_trait]
pub trait AmqpConnector: Send + Sync + 'static {
    /// Open one connection and one channel on it.
    async fn dial(&self, params: &ConnectionParams) -> Result<AmqpLink>;
}

/// A freshly dialed connection with its channel.
pub struct AmqpLink {
    pub connection: Box<dyn AmqpConnection>,
    pub channel: Arc<dyn AmqpChannel>,
    /// Resolves with the close reason once the broker or the transport drops
    /// the connection or channel.
    pub closed: oneshot::Receiver<String>,
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Extra arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArgs {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArgs {
    /// Route expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(exchange: &str, routing_key: &str) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.to_string()),
            dead_letter_routing_key: Some(routing_key.to_string()),
        }
    }
}

/// Operations on one open channel.
///
/// Exchanges are always declared durable and topic-typed, queues durable.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Send without waiting for a publisher confirm.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Stop the consumer registered under `consumer_tag`. Unacked deliveries
    /// go back to the queue.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

/// Settles one delivery on the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue.
///
/// Settling consumes the delivery, so it is acked or rejected exactly once.
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: impl Acknowledger + 'static) -> Self {
        Self {
            payload,
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Remove the message from the queue.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
