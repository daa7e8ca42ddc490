//! Kafka consumer groups backed by `rdkafka`
//!
//! One `StreamConsumer` per group id. A session lasts from one rebalance to
//! the next: every partition that yields records gets its own claim task,
//! fed through a bounded channel so a slow batch handler throttles polling.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::group::{ClaimHandler, GroupConnection, GroupConnector, GroupSession, PartitionClaim};
use crate::error::{MqError, Result};
use crate::types::{ConsumerRecord, KafkaConfig};

/// Records buffered per partition between the poll loop and its claim.
const CLAIM_BUFFER: usize = 256;

/// Forwards client errors and counts rebalances.
struct GroupContext {
    group_id: String,
    errors: mpsc::UnboundedSender<MqError>,
    rebalances: watch::Sender<u64>,
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        debug!(group = %self.group_id, reason = %reason, "Kafka client error");
        let _ = self.errors.send(MqError::Kafka(error));
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(
                group = %self.group_id,
                partitions = partitions.count(),
                "Revoking partitions"
            );
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    group = %self.group_id,
                    partitions = partitions.count(),
                    "Partitions assigned"
                );
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(group = %self.group_id, error = %e, "Rebalance error");
                let _ = self.errors.send(MqError::Kafka(e.clone()));
            }
        }
        self.rebalances.send_modify(|epoch| *epoch += 1);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(group = %self.group_id, partitions = offsets.count(), "Offsets committed"),
            Err(e) => warn!(group = %self.group_id, error = %e, "Offset commit failed"),
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// Joins consumer groups on a Kafka cluster.
pub struct KafkaGroupConnector {
    config: KafkaConfig,
    bootstrap_servers: String,
}

impl KafkaGroupConnector {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        Ok(Self {
            bootstrap_servers: config.bootstrap_servers()?,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl GroupConnector for KafkaGroupConnector {
    async fn connect(&self, group_id: &str) -> Result<Arc<dyn GroupConnection>> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (rebalances, _) = watch::channel(0);
        let context = GroupContext {
            group_id: group_id.to_string(),
            errors: errors_tx,
            rebalances: rebalances.clone(),
        };

        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("max.poll.interval.ms", self.config.max_poll_interval_ms.to_string())
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .create_with_context(context)?;

        info!(
            bootstrap = %self.bootstrap_servers,
            group = %group_id,
            "Kafka consumer created"
        );

        Ok(Arc::new(KafkaGroupConnection {
            group_id: group_id.to_string(),
            consumer: Arc::new(consumer),
            topics: Mutex::new(BTreeSet::new()),
            session_lock: tokio::sync::Mutex::new(()),
            rebalances,
            errors: Mutex::new(Some(errors_rx)),
        }))
    }
}

struct KafkaGroupConnection {
    group_id: String,
    consumer: Arc<GroupConsumer>,
    /// Union of the topics of every `consume` call
    topics: Mutex<BTreeSet<String>>,
    /// One poll loop at a time
    session_lock: tokio::sync::Mutex<()>,
    rebalances: watch::Sender<u64>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<MqError>>>,
}

impl KafkaGroupConnection {
    fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut subscribed = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribed.len();
        subscribed.extend(topics.iter().cloned());
        if subscribed.len() == before && before > 0 {
            return Ok(());
        }

        let names: Vec<&str> = subscribed.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        info!(group = %self.group_id, topics = ?names, "Subscribed to topics");
        Ok(())
    }
}

/// Feed of one claimed partition.
struct Feed {
    records: mpsc::Sender<ConsumerRecord>,
    buffered: Arc<AtomicUsize>,
}

fn owned_record(message: &BorrowedMessage<'_>) -> ConsumerRecord {
    let mut record = ConsumerRecord::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    );
    record.key = message.key().map(<[u8]>::to_vec);
    record.timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis);
    record
}

#[async_trait]
impl GroupConnection for KafkaGroupConnection {
    #[instrument(skip(self, handler, cancel), fields(group = %self.group_id))]
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        // Subscribing to new topics triggers a rebalance, which ends any
        // session currently holding the lock
        self.subscribe(topics)?;
        let _session_guard = self.session_lock.lock().await;

        let mut rebalances = self.rebalances.subscribe();
        let _ = rebalances.borrow_and_update();

        let session: Arc<dyn GroupSession> = Arc::new(KafkaGroupSession {
            consumer: self.consumer.clone(),
            marked: Mutex::new(HashMap::new()),
        });
        let mut feeds: HashMap<(String, i32), Feed> = HashMap::new();
        let mut claims = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                changed = rebalances.changed() => {
                    if changed.is_ok() {
                        info!(group = %self.group_id, "Rebalance, ending session");
                    }
                    break Ok(());
                }
                Some(joined) = claims.join_next(), if !claims.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Err(e),
                        Err(e) => break Err(MqError::connectivity(&self.group_id, e)),
                    }
                }
                received = async { self.consumer.recv().await.map(|m| owned_record(&m)) } => {
                    let record = match received {
                        Ok(record) => record,
                        Err(e) => break Err(e.into()),
                    };

                    let slot = (record.topic.clone(), record.partition);
                    let feed = feeds.entry(slot).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                        let buffered = Arc::new(AtomicUsize::new(0));
                        let claim = KafkaClaim {
                            topic: record.topic.clone(),
                            partition: record.partition,
                            records: rx,
                            buffered: buffered.clone(),
                        };
                        let handler = handler.clone();
                        let session = session.clone();
                        claims.spawn(async move { handler.consume_claim(session, Box::new(claim)).await });
                        Feed { records: tx, buffered }
                    });

                    feed.buffered.fetch_add(1, Ordering::SeqCst);
                    if feed.records.send(record).await.is_err() {
                        // Claim already finished; the record stays uncommitted
                        feed.buffered.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        };

        // Closing the feeds lets every claim drain and finish
        drop(feeds);
        while let Some(joined) = claims.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(group = %self.group_id, error = %e, "Claim ended with error"),
                Err(e) => warn!(group = %self.group_id, error = %e, "Claim task failed"),
            }
        }

        outcome
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<MqError>> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(group = %self.group_id, "Kafka consumer closed");
        Ok(())
    }
}

struct KafkaClaim {
    topic: String,
    partition: i32,
    records: mpsc::Receiver<ConsumerRecord>,
    buffered: Arc<AtomicUsize>,
}

#[async_trait]
impl PartitionClaim for KafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<ConsumerRecord> {
        let record = self.records.recv().await?;
        self.buffered.fetch_sub(1, Ordering::SeqCst);
        Some(record)
    }

    fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

struct KafkaGroupSession {
    consumer: Arc<GroupConsumer>,
    marked: Mutex<HashMap<(String, i32), i64>>,
}

impl GroupSession for KafkaGroupSession {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let marked: Vec<_> = self
            .marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if marked.is_empty() {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        for ((topic, partition), offset) in &marked {
            offsets.add_partition_offset(topic, *partition, Offset::Offset(*offset))?;
        }
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
