//! RabbitMQ client backed by `lapin`
//!
//! Implements the AMQP transport seam: dialing with connection metadata,
//! topic exchanges, durable queues and manual-ack consumers.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::transport::{
    Acknowledger, AmqpChannel, AmqpConnection, AmqpConnector, AmqpLink, DeliveryStream,
    InboundDelivery, QueueArgs,
};
use crate::error::{MqError, Result};
use crate::types::{ConnectionParams, OutboundMessage};

/// Connector that dials real brokers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    #[instrument(skip(self, params), fields(connection = %params.connection_name))]
    async fn dial(&self, params: &ConnectionParams) -> Result<AmqpLink> {
        let mut uri: AMQPUri = params
            .uri
            .parse()
            .map_err(|e: String| MqError::Config(format!("invalid AMQP uri: {e}")))?;
        if !params.vhost.is_empty() {
            uri.vhost = params.vhost.clone();
        }
        let heartbeat = params.heartbeat.as_secs().min(u64::from(u16::MAX)) as u16;
        uri.query.heartbeat = Some(heartbeat);

        // Never log the credentials part of the URI
        let target = format!("{}:{}{}", uri.authority.host, uri.authority.port, uri.vhost);

        let mut properties =
            ConnectionProperties::default().with_connection_name(params.connection_name.clone().into());
        properties
            .client_properties
            .insert("platform".into(), AMQPValue::LongString("rust".into()));

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(|e| MqError::connectivity(&target, e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MqError::connectivity(&target, e))?;

        // Connection and channel errors both count as a closed link
        let (tx, closed) = oneshot::channel();
        let notify = Arc::new(Mutex::new(Some(tx)));
        let on_connection = notify.clone();
        connection.on_error(move |err| fire(&on_connection, format!("connection error: {err}")));
        channel.on_error(move |err| fire(&notify, format!("channel error: {err}")));

        info!(target = %target, heartbeat_secs = heartbeat, "RabbitMQ connection opened");

        Ok(AmqpLink {
            connection: Box::new(LapinConnection(connection)),
            channel: Arc::new(LapinChannel(channel)),
            closed,
        })
    }
}

fn fire(slot: &Mutex<Option<oneshot::Sender<String>>>, reason: String) {
    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(sender) = sender {
        // The supervisor may already have torn the link down
        let _ = sender.send(reason);
    }
}

struct LapinConnection(Connection);

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn close(&self) -> Result<()> {
        self.0
            .close(200, "Bye")
            .await
            .map_err(|e| MqError::connectivity("connection", e))
    }
}

struct LapinChannel(Channel);

/// Broker refusals are configuration errors, everything else is transport.
fn classify(object: String, err: lapin::Error) -> MqError {
    match err {
        lapin::Error::ProtocolError(_) => MqError::topology(object, err),
        other => MqError::connectivity(object, other),
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.0
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(format!("exchange {exchange}"), e))
    }

    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &args.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }
        if let Some(routing_key) = &args.dead_letter_routing_key {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }

        self.0
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|e| classify(format!("queue {queue}"), e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(format!("binding {exchange} -> {queue} ({routing_key})"), e))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.0
            .basic_qos(count, BasicQosOptions { global: true })
            .await
            .map_err(|e| classify("qos".to_string(), e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(expiration) = message.expiration_property() {
            properties = properties.with_expiration(expiration.into());
        }

        // Publisher confirms are not awaited
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| classify(format!("publish to {exchange}"), e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(format!("consumer on {queue}"), e))?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer registered");

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(InboundDelivery::new(
                delivery.data,
                delivery.redelivered,
                LapinAcker(delivery.acker),
            )),
            Err(e) => Err(MqError::connectivity("consumer", e)),
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MqError::connectivity(format!("consumer {consumer_tag}"), e))
    }

    async fn close(&self) -> Result<()> {
        if !self.0.status().connected() {
            return Ok(());
        }
        self.0.close(200, "OK").await.map_err(|e| {
            warn!(error = %e, "Failed to close channel");
            MqError::connectivity("channel", e)
        })
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MqError::connectivity("ack", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| MqError::connectivity("reject", e))
    }
}
