//! Kafka producer
//!
//! Fire-and-forget: records are queued on librdkafka and delivery failures
//! are logged by a background task instead of being returned to the caller.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::types::KafkaConfig;

/// Asynchronous record producer.
pub struct KafkaProducer {
    producer: FutureProducer,
    deliveries: mpsc::UnboundedSender<(String, DeliveryFuture)>,
}

impl KafkaProducer {
    /// Create the producer and its delivery reporter. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let bootstrap_servers = config.bootstrap_servers()?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("acks", "all")
            .set("compression.type", "snappy")
            .set("linger.ms", "10")
            .create()?;

        let (deliveries, pending) = mpsc::unbounded_channel();
        tokio::spawn(report_deliveries(pending));

        info!(bootstrap = %bootstrap_servers, "Kafka producer created");

        Ok(Self {
            producer,
            deliveries,
        })
    }

    /// Queue `payload` for `topic` and return without waiting for delivery.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub fn send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(payload);
        let delivery = self.producer.send_result(record).map_err(|(e, _)| e)?;

        if self.deliveries.send((topic.to_string(), delivery)).is_err() {
            debug!(topic = %topic, "Delivery reporter stopped");
        }
        Ok(())
    }

    /// Serialize `value` as JSON and send it.
    pub fn send_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<()> {
        let payload = JsonCodec.encode(value)?;
        self.send(topic, &payload)
    }

    /// Wait for queued records to be delivered, at most `timeout`.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout)?;
        info!("Kafka producer flushed");
        Ok(())
    }
}

async fn report_deliveries(mut pending: mpsc::UnboundedReceiver<(String, DeliveryFuture)>) {
    while let Some((topic, delivery)) = pending.recv().await {
        match delivery.await {
            Ok(Ok(_)) => {}
            Ok(Err((e, _))) => warn!(topic = %topic, error = %e, "Failed to deliver record"),
            Err(_) => warn!(topic = %topic, "Record dropped before delivery"),
        }
    }
}
