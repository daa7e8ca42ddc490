//! Message and record types moved between the application and the brokers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a subscriber's queue is bound to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Topology {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// A serialized message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    /// Per-message TTL, set for dead-letter delayed delivery
    pub expiration: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// AMQP `expiration` property: milliseconds as a decimal string.
    pub fn expiration_property(&self) -> Option<String> {
        self.expiration.map(|d| d.as_millis().to_string())
    }
}

/// Unit of batching: one aggregator per (consumer group, topic).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub group_id: String,
    pub topic: String,
}

impl GroupKey {
    pub fn new(group_id: &str, topic: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.topic)
    }
}

/// A record fetched from one partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumerRecord {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload,
            timestamp: None,
        }
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}
