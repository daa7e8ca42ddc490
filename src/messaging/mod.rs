//! # Messaging Module
//!
//! Broker clients that survive outages.
//!
//! ## Features
//! - RabbitMQ connection supervisor with constant-interval reconnects
//! - Publisher with dead-letter delayed delivery
//! - Subscriber whose consumers restart after every reconnect
//! - Kafka consumer groups with per-partition batching and commit-after-success
//! - Committed offset lookup and a fire-and-forget Kafka producer

pub mod aggregator;
pub mod dispatcher;
pub mod group;
pub mod kafka_admin;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod offset_lookup;
pub mod publisher;
pub mod rabbit_client;
pub mod subscriber;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use aggregator::{AggregatorState, BatchHandler, PartitionBatchAggregator};
pub use dispatcher::ConsumerGroupDispatcher;
pub use group::{
    AdminConnector, ClaimHandler, ClusterAdmin, GroupConnection, GroupConnector, GroupSession,
    PartitionClaim,
};
pub use kafka_admin::KafkaAdminConnector;
pub use kafka_consumer::KafkaGroupConnector;
pub use kafka_producer::KafkaProducer;
pub use offset_lookup::OffsetLookup;
pub use publisher::Publisher;
pub use rabbit_client::LapinConnector;
pub use subscriber::{settlement, DeliveryHandler, Settlement, Subscriber, Subscription};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use transport::{
    Acknowledger, AmqpChannel, AmqpConnection, AmqpConnector, AmqpLink, DeliveryStream,
    InboundDelivery, QueueArgs,
};
