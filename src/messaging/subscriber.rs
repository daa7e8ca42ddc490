//! RabbitMQ subscriber
//!
//! Each subscription runs its own consume loop which re-declares its topology
//! and restarts after every reconnect of the supervised connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::supervisor::{ConnectionState, ConnectionSupervisor};
use super::transport::{AmqpChannel, AmqpConnector, QueueArgs};
use crate::error::{MqError, Result};
use crate::types::{RabbitConfig, Topology};

/// Application logic for one subscription. Returning `false` asks for the
/// delivery to be retried once.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> bool;
}

#[async_trait]
impl<F> DeliveryHandler for F
where
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, payload: &[u8]) -> bool {
        self(payload)
    }
}

/// What happens to a delivery after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Reject and put back on the queue
    Requeue,
    /// Failed on redelivery: acked so it is not retried again
    Drop,
}

/// A failed delivery is requeued once and dropped the second time.
pub fn settlement(handled: bool, redelivered: bool) -> Settlement {
    match (handled, redelivered) {
        (true, _) => Settlement::Ack,
        (false, false) => Settlement::Requeue,
        (false, true) => Settlement::Drop,
    }
}

/// Consumes queues over a supervised connection.
pub struct Subscriber {
    supervisor: ConnectionSupervisor,
    /// Consumer tags must be unique per channel
    next_tag: AtomicUsize,
}

impl Subscriber {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self {
            supervisor,
            next_tag: AtomicUsize::new(0),
        }
    }

    /// Subscriber with its own connection, using the consumer heartbeat.
    pub fn for_consumer(
        connector: Arc<dyn AmqpConnector>,
        config: &RabbitConfig,
        connection_name: &str,
        cancel: &CancellationToken,
    ) -> Self {
        let supervisor = ConnectionSupervisor::start(
            connector,
            config.consumer_connection(connection_name),
            config.retry_policy(),
            cancel,
        );
        Self::new(supervisor)
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Bind `queue` to `exchange` with `routing_key` and feed every delivery
    /// to `handler`.
    ///
    /// When the connection is up the topology is declared before returning,
    /// so a broker refusal surfaces here. Otherwise consumption starts as
    /// soon as the supervisor connects.
    #[instrument(skip(self, handler))]
    pub async fn subscribe<H>(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        handler: H,
    ) -> Result<Subscription>
    where
        H: DeliveryHandler,
    {
        let topology = Topology::new(exchange, queue, routing_key);

        if self.supervisor.state() == ConnectionState::Connected {
            if let Some(channel) = self.supervisor.current_channel().await {
                match declare_topology(channel.as_ref(), &topology).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(error = %e, "Topology declaration failed, consumer will retry"),
                }
            }
        }

        let consumer_tag = format!(
            "{}-{}",
            self.supervisor.params().connection_name,
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        );
        let cancel = self.supervisor.cancellation().child_token();
        let task = tokio::spawn(consume_loop(
            self.supervisor.clone(),
            topology.clone(),
            consumer_tag,
            Arc::new(handler),
            cancel.clone(),
        ));

        Ok(Subscription {
            topology,
            cancel,
            task,
        })
    }

    /// Stop every subscription and close the connection.
    pub async fn close(&self) {
        self.supervisor.close().await;
    }
}

/// Handle to a running consume loop.
pub struct Subscription {
    topology: Topology,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Subscription {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Stop consuming and cancel the consumer on the broker. The connection
    /// stays open for other users.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the consume loop to end. Returns the fatal error that ended
    /// it, if any.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(queue = %self.topology.queue, error = %e, "Consumer task aborted");
                Err(MqError::Closed)
            }
        }
    }
}

async fn declare_topology(channel: &dyn AmqpChannel, topology: &Topology) -> Result<()> {
    channel.declare_exchange(&topology.exchange).await?;
    channel
        .declare_queue(&topology.queue, &QueueArgs::default())
        .await?;
    channel
        .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
        .await
}

async fn consume_loop(
    supervisor: ConnectionSupervisor,
    topology: Topology,
    consumer_tag: String,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut state = supervisor.subscribe_state();
    let retry_delay = supervisor.retry_policy().delay;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = async {
                state
                    .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
                    .await
                    .map(|s| *s == ConnectionState::Connected)
                    .unwrap_or(false)
            } => connected,
        };
        if !connected {
            debug!(queue = %topology.queue, "Connection closed, consumer stopping");
            return Ok(());
        }

        match run_consumer(&supervisor, &topology, &consumer_tag, handler.as_ref(), &cancel).await {
            Ok(()) if cancel.is_cancelled() => return Ok(()),
            Ok(()) => info!(queue = %topology.queue, "Delivery stream ended, restarting consumer"),
            Err(e) if e.is_fatal() => {
                error!(
                    exchange = %topology.exchange,
                    queue = %topology.queue,
                    error = %e,
                    "Consumer topology rejected, giving up"
                );
                return Err(e);
            }
            Err(e) => warn!(queue = %topology.queue, error = %e, "Consumer failed, restarting"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

/// Consume until the stream ends or the subscription is cancelled.
async fn run_consumer(
    supervisor: &ConnectionSupervisor,
    topology: &Topology,
    consumer_tag: &str,
    handler: &dyn DeliveryHandler,
    cancel: &CancellationToken,
) -> Result<()> {
    let channel = supervisor
        .current_channel()
        .await
        .ok_or_else(|| MqError::connectivity(consumer_tag, "not connected"))?;

    declare_topology(channel.as_ref(), topology).await?;
    channel.set_prefetch(1).await?;
    let mut deliveries = channel.consume(&topology.queue, consumer_tag).await?;

    info!(
        exchange = %topology.exchange,
        queue = %topology.queue,
        routing_key = %topology.routing_key,
        consumer_tag = %consumer_tag,
        "Started consuming"
    );

    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => {
                // Releases the prefetched delivery and the tag
                if let Err(e) = channel.cancel(consumer_tag).await {
                    debug!(queue = %topology.queue, error = %e, "Consumer cancel failed");
                }
                return Ok(());
            }
            next = deliveries.next() => match next {
                Some(delivery) => delivery?,
                None => return Ok(()),
            },
        };

        let handled = handler.handle(&delivery.payload).await;
        let settled = match settlement(handled, delivery.redelivered) {
            Settlement::Ack => delivery.ack().await,
            Settlement::Requeue => delivery.reject(true).await,
            Settlement::Drop => {
                warn!(queue = %topology.queue, "Delivery failed twice, dropping");
                delivery.ack().await
            }
        };
        if let Err(e) = settled {
            warn!(queue = %topology.queue, error = %e, "Failed to settle delivery");
        }
    }
}
