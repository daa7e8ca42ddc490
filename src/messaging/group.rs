//! Seams between the batching consumer-group core and the Kafka client.
//!
//! A group connection runs sessions (one per rebalance epoch). Each session
//! hands every claimed partition to a [`ClaimHandler`] on its own task, and
//! the handler marks and commits offsets through the [`GroupSession`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{MqError, Result};
use crate::types::ConsumerRecord;

/// Offset bookkeeping of the current group session.
pub trait GroupSession: Send + Sync {
    /// Record `offset` as the next position to consume for the partition.
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Commit everything marked so far.
    fn commit(&self) -> Result<()>;
}

/// One partition's record stream for the duration of a session.
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// `None` once the session ends and the buffer is drained.
    async fn next_record(&mut self) -> Option<ConsumerRecord>;

    /// Records fetched for this partition but not yet returned.
    fn buffered(&self) -> usize;
}

#[async_trait]
pub trait ClaimHandler: Send + Sync {
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: Box<dyn PartitionClaim>,
    ) -> Result<()>;
}

/// A joined consumer group.
#[async_trait]
pub trait GroupConnection: Send + Sync {
    /// Run one session over `topics`. Returns when the session ends, which
    /// happens on rebalance or cancellation.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Cluster errors of this group; can be taken once.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<MqError>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait GroupConnector: Send + Sync + 'static {
    async fn connect(&self, group_id: &str) -> Result<Arc<dyn GroupConnection>>;
}

/// Read access to cluster metadata.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// The committed offset of a group on one partition, if any.
    async fn committed_offset(&self, group: &str, topic: &str, partition: i32)
        -> Result<Option<i64>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AdminConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn ClusterAdmin>>;
}
