//! Core types for the messaging clients.

mod config;
mod message;

pub use config::{
    BatchConfig, ConnectionParams, KafkaConfig, MessagingConfig, RabbitConfig, RetryPolicy,
};
pub use message::{ConsumerRecord, GroupKey, OutboundMessage, Topology};
