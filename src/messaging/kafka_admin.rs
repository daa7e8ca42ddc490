//! Cluster metadata queries backed by `rdkafka`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::group::{AdminConnector, ClusterAdmin};
use crate::error::{MqError, Result};
use crate::types::KafkaConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaAdminConnector {
    bootstrap_servers: String,
}

impl KafkaAdminConnector {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            bootstrap_servers: config.bootstrap_servers()?,
        })
    }
}

#[async_trait]
impl AdminConnector for KafkaAdminConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterAdmin>> {
        info!(bootstrap = %self.bootstrap_servers, "Kafka admin client created");
        Ok(Arc::new(KafkaClusterAdmin {
            bootstrap_servers: self.bootstrap_servers.clone(),
            consumers: Mutex::new(HashMap::new()),
        }))
    }
}

/// Reads committed offsets through one idle consumer per group.
struct KafkaClusterAdmin {
    bootstrap_servers: String,
    consumers: Mutex<HashMap<String, Arc<BaseConsumer>>>,
}

impl KafkaClusterAdmin {
    fn consumer(&self, group: &str) -> Result<Arc<BaseConsumer>> {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(consumer) = consumers.get(group) {
            return Ok(consumer.clone());
        }

        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .create()?;
        let consumer = Arc::new(consumer);
        consumers.insert(group.to_string(), consumer.clone());
        Ok(consumer)
    }
}

#[async_trait]
impl ClusterAdmin for KafkaClusterAdmin {
    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>> {
        let consumer = self.consumer(group)?;
        let topic_name = topic.to_string();

        // librdkafka blocks until the coordinator answers
        let committed = tokio::task::spawn_blocking(move || {
            let mut wanted = TopicPartitionList::new();
            wanted.add_partition(&topic_name, partition);
            let committed = consumer.committed_offsets(wanted, METADATA_TIMEOUT)?;
            Ok::<_, MqError>(
                committed
                    .find_partition(&topic_name, partition)
                    .map(|elem| elem.offset()),
            )
        })
        .await
        .map_err(|e| MqError::connectivity("kafka admin", e))??;

        debug!(group = %group, topic = %topic, partition, offset = ?committed, "Committed offset fetched");
        match committed {
            Some(Offset::Offset(offset)) => Ok(Some(offset)),
            _ => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
