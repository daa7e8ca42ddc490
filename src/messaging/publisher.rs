//! RabbitMQ publisher
//!
//! All exchanges are topic exchanges; for fanout semantics bind with `#`.
//! Routing keys are best kept hierarchical (`level1.level2.level3`).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::supervisor::ConnectionSupervisor;
use super::transport::{AmqpConnector, QueueArgs};
use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::types::{OutboundMessage, RabbitConfig};
use crate::DELAY_QUEUE_NAME;

/// Publishes immediate and delayed messages over a supervised connection.
pub struct Publisher<C: Codec = JsonCodec> {
    supervisor: ConnectionSupervisor,
    codec: C,
}

impl Publisher<JsonCodec> {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self::with_codec(supervisor, JsonCodec)
    }

    /// Publisher with its own connection, using the producer heartbeat.
    pub fn for_producer(
        connector: Arc<dyn AmqpConnector>,
        config: &RabbitConfig,
        connection_name: &str,
        cancel: &CancellationToken,
    ) -> Self {
        let supervisor = ConnectionSupervisor::start(
            connector,
            config.producer_connection(connection_name),
            config.retry_policy(),
            cancel,
        );
        Self::new(supervisor)
    }
}

impl<C: Codec> Publisher<C> {
    pub fn with_codec(supervisor: ConnectionSupervisor, codec: C) -> Self {
        Self { supervisor, codec }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Publish `message` to `exchange`. Returns once the broker accepted the
    /// frame; there is no delivery confirmation.
    #[instrument(skip(self, message))]
    pub async fn publish<T>(&self, message: &T, exchange: &str, routing_key: &str) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let channel = self.supervisor.channel().await?;
        channel.declare_exchange(exchange).await?;

        let payload = self.codec.encode(message)?;
        channel
            .publish(exchange, routing_key, &OutboundMessage::new(payload))
            .await?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Message published");
        Ok(())
    }

    /// Publish `message` so it reaches `exchange` after `delay`.
    ///
    /// The message waits in the shared delay queue with a per-message TTL
    /// and is dead-lettered to the target exchange when it expires.
    #[instrument(skip(self, message))]
    pub async fn publish_delayed<T>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
        delay: Duration,
    ) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let channel = self.supervisor.channel().await?;
        channel.declare_exchange(exchange).await?;
        channel
            .declare_queue(DELAY_QUEUE_NAME, &QueueArgs::dead_letter(exchange, routing_key))
            .await?;

        let payload = self.codec.encode(message)?;
        let message = OutboundMessage::new(payload).with_expiration(delay);
        channel.publish("", DELAY_QUEUE_NAME, &message).await?;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            delay_ms = delay.as_millis() as u64,
            "Delayed message published"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.supervisor.close().await;
    }
}
