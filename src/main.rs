//! Resilient messaging demo
//!
//! Subscribes to a RabbitMQ topic and consumes a Kafka topic in batches,
//! logging what arrives, until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resilient_mq::messaging::{KafkaGroupConnector, LapinConnector};
use resilient_mq::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "resilient_mq=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config_path = std::env::var("MQ_CONFIG").ok().map(PathBuf::from);
    let config = MessagingConfig::load(config_path.as_deref())?;

    let exchange = std::env::var("DEMO_EXCHANGE").unwrap_or_else(|_| "demo".into());
    let queue = std::env::var("DEMO_QUEUE").unwrap_or_else(|_| "demo.inbox".into());
    let topic = std::env::var("DEMO_TOPIC").unwrap_or_else(|_| "demo.events".into());
    let group = std::env::var("DEMO_GROUP").unwrap_or_else(|_| "resilient-mq-demo".into());

    info!("Starting resilient-mq demo v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();

    // RabbitMQ
    let subscriber = Subscriber::for_consumer(
        Arc::new(LapinConnector),
        &config.rabbitmq,
        "resilient-mq-demo",
        &shutdown,
    );
    let subscription = subscriber
        .subscribe(&exchange, &queue, "#", |payload: &[u8]| {
            info!(bytes = payload.len(), body = %String::from_utf8_lossy(payload), "Message received");
            true
        })
        .await?;

    // Kafka
    let dispatcher = ConsumerGroupDispatcher::from_config(
        Arc::new(KafkaGroupConnector::new(&config.kafka)?),
        &config.kafka,
        &shutdown,
    );
    let receiver = {
        let dispatcher = dispatcher.clone();
        let batch = config.kafka.batch();
        tokio::spawn(async move {
            dispatcher
                .receive(&topic, &group, batch, |records: &[ConsumerRecord]| {
                    let first = records.first().map(|r| r.offset).unwrap_or_default();
                    info!(records = records.len(), first_offset = first, "Batch received");
                    true
                })
                .await
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();

    subscription.close();
    if let Err(e) = subscription.join().await {
        error!(error = %e, "Subscription ended with error");
    }
    subscriber.close().await;

    dispatcher.close().await;
    match tokio::time::timeout(Duration::from_secs(5), receiver).await {
        Ok(Ok(Err(e))) => error!(error = %e, "Kafka receiver ended with error"),
        Ok(Err(e)) => error!(error = %e, "Kafka receiver task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => error!("Kafka receiver did not stop in time"),
    }

    Ok(())
}
