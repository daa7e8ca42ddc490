//! Resilient messaging core
//!
//! Self-healing RabbitMQ publishing and subscription on top of a single
//! supervised connection, and a batching Kafka consumer-group framework that
//! commits offsets only after a batch was handled successfully.

use std::time::Duration;

pub mod codec;
pub mod error;
pub mod messaging;
pub mod types;

pub use codec::{Codec, JsonCodec};
pub use error::{MqError, Result};
pub use messaging::{
    BatchHandler, ConnectionState, ConnectionSupervisor, ConsumerGroupDispatcher,
    DeliveryHandler, KafkaProducer, OffsetLookup, PartitionBatchAggregator, Publisher,
    Subscriber, Subscription,
};
pub use types::{
    BatchConfig, ConnectionParams, ConsumerRecord, GroupKey, KafkaConfig, MessagingConfig,
    RabbitConfig, RetryPolicy, Topology,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::*;
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::types::*;
    pub use tokio_util::sync::CancellationToken;
}

/// Pause between reconnect attempts (2s)
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Reconnect delays a publisher waits for connectivity before failing
pub const DEFAULT_MAX_WAIT_ATTEMPTS: u32 = 10;

/// Heartbeat of publishing connections (20 minutes)
pub const PRODUCER_HEARTBEAT: Duration = Duration::from_secs(20 * 60);

/// Heartbeat of consuming connections
pub const CONSUMER_HEARTBEAT: Duration = Duration::from_secs(10);

/// Shared queue that holds delayed messages until they dead-letter
pub const DELAY_QUEUE_NAME: &str = "DelayQueueTemp";

/// Default records per Kafka batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of batches waiting for the batch handler
pub const DEFAULT_DISPATCH_QUEUE_DEPTH: usize = 8;
