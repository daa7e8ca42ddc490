//! Error type shared by the AMQP and Kafka halves of the crate.
//!
//! Errors are classified so callers can tell a transient broker outage
//! (retry later) from a broken configuration (abort startup).

use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MqError>;

#[derive(Debug, Error)]
pub enum MqError {
    /// Dialing, channel or transport failure.
    #[error("broker {target} unreachable: {reason}")]
    Connectivity { target: String, reason: String },

    /// The supervisor did not reach Connected within the wait budget.
    #[error("timed out after {0:?} waiting for broker connection")]
    ConnectTimeout(Duration),

    /// The component was shut down.
    #[error("client has been closed")]
    Closed,

    /// The broker refused an exchange, queue or binding declaration.
    #[error("failed to declare {object}: {reason}")]
    Topology { object: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("no committed offset for {topic}/{partition} in group {group}")]
    OffsetUnavailable {
        topic: String,
        group: String,
        partition: i32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl MqError {
    pub fn connectivity(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connectivity {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn topology(object: impl Into<String>, reason: impl ToString) -> Self {
        Self::Topology {
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures the recovery loops keep retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MqError::Connectivity { .. } | MqError::ConnectTimeout(_) | MqError::Kafka(_)
        )
    }

    /// Failures that must abort startup instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MqError::Topology { .. } | MqError::Config(_))
    }
}

impl From<serde_json::Error> for MqError {
    fn from(e: serde_json::Error) -> Self {
        MqError::Serialization(Box::new(e))
    }
}
