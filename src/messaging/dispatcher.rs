//! Consumer-group dispatcher
//!
//! Joins consumer groups lazily, routes every claimed partition to the
//! aggregator of its (group, topic) and keeps rejoining after rebalances and
//! transient failures until cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::aggregator::{BatchHandler, PartitionBatchAggregator};
use super::group::{ClaimHandler, GroupConnection, GroupConnector, GroupSession, PartitionClaim};
use crate::error::{MqError, Result};
use crate::types::{BatchConfig, GroupKey, KafkaConfig};

/// Group connections and aggregators owned by one dispatcher.
#[derive(Default)]
struct AggregatorRegistry {
    groups: tokio::sync::Mutex<HashMap<String, Arc<dyn GroupConnection>>>,
    aggregators: Mutex<HashMap<GroupKey, Arc<PartitionBatchAggregator>>>,
}

impl AggregatorRegistry {
    /// The connection of `group_id`, joining the group on first use.
    async fn group(
        &self,
        connector: &dyn GroupConnector,
        group_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn GroupConnection>> {
        let mut groups = self.groups.lock().await;
        if let Some(connection) = groups.get(group_id) {
            return Ok(connection.clone());
        }

        let connection = connector.connect(group_id).await?;
        if let Some(errors) = connection.take_errors() {
            tokio::spawn(monitor_errors(group_id.to_string(), errors, cancel.child_token()));
        }
        groups.insert(group_id.to_string(), connection.clone());

        info!(group = %group_id, "Joined consumer group");
        Ok(connection)
    }

    /// The aggregator of `key`, started with `handler` on first use.
    fn aggregator(
        &self,
        key: &GroupKey,
        batch: BatchConfig,
        handler: Arc<dyn BatchHandler>,
        cancel: &CancellationToken,
    ) -> Result<Arc<PartitionBatchAggregator>> {
        let mut aggregators = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so `close_all` cannot miss a late insert
        if cancel.is_cancelled() {
            return Err(MqError::Closed);
        }

        if let Some(aggregator) = aggregators.get(key) {
            warn!(key = %key, "Batch handler already registered, ignoring the new one");
            return Ok(aggregator.clone());
        }

        let aggregator = PartitionBatchAggregator::start(key.clone(), batch, handler, cancel);
        aggregators.insert(key.clone(), aggregator.clone());
        Ok(aggregator)
    }

    fn get(&self, key: &GroupKey) -> Option<Arc<PartitionBatchAggregator>> {
        self.aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<_> = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    async fn close_all(&self) {
        let aggregators: Vec<_> = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, aggregator)| aggregator)
            .collect();
        for aggregator in aggregators {
            aggregator.close().await;
        }

        let groups: Vec<_> = self.groups.lock().await.drain().collect();
        for (group_id, connection) in groups {
            if let Err(e) = connection.close().await {
                warn!(group = %group_id, error = %e, "Failed to close consumer group");
            }
        }
    }
}

/// Feeds each partition claim into the aggregator of its topic.
struct ClaimRouter {
    group_id: String,
    registry: Arc<AggregatorRegistry>,
}

#[async_trait]
impl ClaimHandler for ClaimRouter {
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Box<dyn PartitionClaim>,
    ) -> Result<()> {
        let key = GroupKey::new(&self.group_id, claim.topic());
        let Some(aggregator) = self.registry.get(&key) else {
            // Left uncommitted, consumed again once a handler is registered
            warn!(key = %key, partition = claim.partition(), "No batch handler for claimed topic");
            return Ok(());
        };

        debug!(key = %key, partition = claim.partition(), "Partition claimed");
        while let Some(record) = claim.next_record().await {
            let remaining = claim.buffered();
            aggregator.attach(record, &session, remaining).await?;
        }
        debug!(key = %key, partition = claim.partition(), "Partition claim ended");
        Ok(())
    }
}

async fn monitor_errors(
    group_id: String,
    mut errors: mpsc::UnboundedReceiver<MqError>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            error = errors.recv() => match error {
                Some(e) => warn!(group = %group_id, error = %e, "Consumer group error"),
                None => break,
            },
        }
    }
}

/// Runs batch handlers for (topic, group) pairs.
#[derive(Clone)]
pub struct ConsumerGroupDispatcher {
    connector: Arc<dyn GroupConnector>,
    rejoin_delay: Duration,
    registry: Arc<AggregatorRegistry>,
    cancel: CancellationToken,
}

impl ConsumerGroupDispatcher {
    pub fn new(
        connector: Arc<dyn GroupConnector>,
        rejoin_delay: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            connector,
            rejoin_delay,
            registry: Arc::new(AggregatorRegistry::default()),
            cancel: cancel.child_token(),
        }
    }

    pub fn from_config(
        connector: Arc<dyn GroupConnector>,
        config: &KafkaConfig,
        cancel: &CancellationToken,
    ) -> Self {
        Self::new(connector, config.rejoin_delay(), cancel)
    }

    /// Consume `topic` as `group`, handing batches to `handler`.
    ///
    /// Runs until the dispatcher is closed or a fatal error occurs; sessions
    /// ended by a rebalance are rejoined immediately, failed ones after the
    /// rejoin delay. A second call for the same (group, topic) shares the
    /// first call's aggregator and handler; its own handler is dropped.
    /// Fails with [`MqError::Closed`] once the dispatcher is closed.
    #[instrument(skip(self, handler))]
    pub async fn receive<H>(
        &self,
        topic: &str,
        group: &str,
        batch: BatchConfig,
        handler: H,
    ) -> Result<()>
    where
        H: BatchHandler,
    {
        let key = GroupKey::new(group, topic);
        self.registry
            .aggregator(&key, batch, Arc::new(handler), &self.cancel)?;

        let router: Arc<dyn ClaimHandler> = Arc::new(ClaimRouter {
            group_id: group.to_string(),
            registry: self.registry.clone(),
        });
        let topics = vec![topic.to_string()];

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let failure = match self
                .registry
                .group(self.connector.as_ref(), group, &self.cancel)
                .await
            {
                Ok(connection) => {
                    match connection
                        .consume(&topics, router.clone(), self.cancel.child_token())
                        .await
                    {
                        Ok(()) => {
                            debug!(key = %key, "Group session ended, rejoining");
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if failure.is_fatal() {
                error!(key = %key, error = %failure, "Consumer group failed permanently");
                return Err(failure);
            }
            warn!(
                key = %key,
                error = %failure,
                delay_ms = self.rejoin_delay.as_millis() as u64,
                "Consumer group session failed, rejoining"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.rejoin_delay) => {}
            }
        }
    }

    /// (group, topic) pairs with a running aggregator.
    pub fn keys(&self) -> Vec<GroupKey> {
        self.registry.keys()
    }

    /// Stop every receive loop, aggregator and group connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.registry.close_all().await;
        info!("Consumer group dispatcher closed");
    }
}
